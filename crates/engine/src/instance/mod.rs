use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod agent;
pub mod cleanup;
pub mod container;
pub mod docker;
pub mod persistent_worker;
pub mod pipe;
pub mod prebuilt;
pub mod types;
pub mod unsupported;

pub use agent::AgentCache;
pub use container::ContainerInstance;
pub use persistent_worker::PersistentWorkerInstance;
pub use pipe::{PipeInstance, PipeStage};
pub use prebuilt::PrebuiltInstance;
pub use types::*;
pub use unsupported::UnsupportedInstance;

use crate::build::{TaskDefinition, TaskId};
use crate::config::{DockerSettings, EngineConfig};
use crate::error::Result;

/// Execution backend for a single task.
///
/// `run` provisions the environment, launches the agent pointed at the RPC
/// endpoint and blocks until the agent is done. Everything acquired during
/// `run` is released before it returns, and also when the returned future is
/// dropped half-way (which is how task timeouts cancel a run).
#[async_trait]
pub trait Instance: Send + Sync {
    async fn run(&self, config: &RunConfig) -> anyhow::Result<()>;

    /// Where the task's files live while it runs.
    fn working_directory(&self, project_dir: &Path, dirty_mode: bool) -> PathBuf;

    /// Where the project sources are visible from inside the environment.
    fn project_directory(&self, project_dir: &Path, _dirty_mode: bool) -> PathBuf {
        project_dir.to_path_buf()
    }

    /// Whether `run` launches an agent that reports command outcomes. Instances
    /// that only prepare an environment succeed when `run` does.
    fn launches_agent(&self) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str;
}

/// Everything an instance needs to launch the agent for one task.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    /// RPC endpoint as reachable from inside a container.
    pub container_endpoint: String,
    /// RPC endpoint as reachable from a process on this host.
    pub direct_endpoint: String,
    pub server_secret: String,
    pub client_secret: String,
    pub task_id: TaskId,
    pub agent_version: String,
    pub dirty_mode: bool,
}

impl RunConfig {
    pub fn agent_args(&self, endpoint: &str) -> Vec<String> {
        vec![
            "-api-endpoint".to_string(),
            endpoint.to_string(),
            "-server-token".to_string(),
            self.server_secret.clone(),
            "-client-token".to_string(),
            self.client_secret.clone(),
            "-task-id".to_string(),
            self.task_id.to_string(),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceSpec {
    Container(ContainerSpec),
    Pipe(PipeSpec),
    Prebuilt(PrebuiltSpec),
    PersistentWorker(PersistentWorkerSpec),
    Vm(VmSpec),
    #[serde(other)]
    Other,
}

/// Selects the backend for a task once, when the build is constructed.
pub struct InstanceFactory {
    docker: DockerSettings,
    agent_cache: Arc<AgentCache>,
}

impl InstanceFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            docker: config.docker.clone(),
            agent_cache: Arc::new(AgentCache::new(config.agent.clone())),
        }
    }

    pub fn create(&self, definition: &TaskDefinition) -> Result<Arc<dyn Instance>> {
        let instance: Arc<dyn Instance> = match &definition.instance {
            Some(InstanceSpec::Container(spec)) => Arc::new(ContainerInstance::new(
                spec.clone(),
                self.docker.clone(),
                self.agent_cache.clone(),
            )),
            Some(InstanceSpec::Pipe(spec)) => Arc::new(PipeInstance::new(
                spec.clone(),
                &definition.commands,
                self.docker.clone(),
                self.agent_cache.clone(),
            )?),
            Some(InstanceSpec::Prebuilt(spec)) => {
                Arc::new(PrebuiltInstance::new(spec.clone(), self.docker.clone())?)
            }
            Some(InstanceSpec::PersistentWorker(spec)) => Arc::new(PersistentWorkerInstance::new(
                spec.clone(),
                self.agent_cache.clone(),
            )),
            Some(InstanceSpec::Vm(spec)) => Arc::new(UnsupportedInstance::new(format!(
                "virtual machine instances ({}) are not supported by the local executor",
                spec.image
            ))),
            Some(InstanceSpec::Other) => Arc::new(UnsupportedInstance::new(format!(
                "task {} uses an unknown instance type",
                definition.id
            ))),
            None => Arc::new(UnsupportedInstance::new(format!(
                "task {} does not declare an instance",
                definition.id
            ))),
        };

        tracing::debug!("Task {} will run on a {} instance", definition.id, instance.kind());
        Ok(instance)
    }
}
