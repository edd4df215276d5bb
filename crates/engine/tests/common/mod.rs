#![allow(dead_code)]

use localci_engine::build::{Build, Command, TaskDefinition, TaskId};
use localci_engine::instance::{Instance, UnsupportedInstance};
use localci_engine::rpc::{RpcOptions, RpcServer};
use localci_proto::agent::agent_service_client::AgentServiceClient;
use localci_proto::agent::TaskIdentification;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tonic::transport::Channel;

pub fn definition(id: TaskId, commands: Vec<Command>, depends_on: Vec<TaskId>) -> TaskDefinition {
    TaskDefinition {
        id,
        name: format!("task-{}", id),
        commands,
        depends_on,
        environment: HashMap::new(),
        metadata: HashMap::new(),
        instance: None,
    }
}

pub fn scripts(names: &[&str]) -> Vec<Command> {
    names
        .iter()
        .map(|name| Command::script(*name, &["true"]))
        .collect()
}

pub fn test_options(temp_dir: &TempDir) -> RpcOptions {
    RpcOptions {
        listen_address: "127.0.0.1:0".to_string(),
        shutdown_grace: Duration::from_secs(1),
        artifacts_dir: Some(temp_dir.path().join("artifacts")),
        logs_dir: Some(temp_dir.path().join("logs")),
        ..RpcOptions::default()
    }
}

/// An RPC server bound to a build whose tasks never run on their own; tests
/// play the agent through the generated client.
pub struct RpcHarness {
    pub temp_dir: TempDir,
    pub build: Arc<Build>,
    pub server: RpcServer,
}

impl RpcHarness {
    pub async fn start(definitions: Vec<TaskDefinition>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let options = test_options(&temp_dir);
        Self::start_in(temp_dir, definitions, options).await
    }

    pub async fn start_in(
        temp_dir: TempDir,
        definitions: Vec<TaskDefinition>,
        options: RpcOptions,
    ) -> Self {
        let project_dir = temp_dir.path().join("project");
        std::fs::create_dir_all(&project_dir).unwrap();

        let tasks = definitions
            .into_iter()
            .map(|definition| {
                let instance: Arc<dyn Instance> = Arc::new(UnsupportedInstance::new("harness"));
                (definition, instance)
            })
            .collect();

        let build = Arc::new(
            Build::with_instances(&project_dir, tasks, &temp_dir.path().join("cache"))
                .await
                .unwrap(),
        );
        let server = RpcServer::start(build.clone(), options).await.unwrap();

        Self {
            temp_dir,
            build,
            server,
        }
    }

    pub async fn client(&self) -> AgentServiceClient<Channel> {
        connect(&self.server.direct_endpoint()).await
    }

    pub fn identification(&self, task_id: TaskId) -> Option<TaskIdentification> {
        Some(TaskIdentification {
            task_id,
            secret: self.server.client_secret().to_string(),
        })
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.temp_dir.path().join("artifacts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.temp_dir.path().join("logs")
    }
}

pub async fn connect(endpoint: &str) -> AgentServiceClient<Channel> {
    AgentServiceClient::connect(format!("http://{}", endpoint))
        .await
        .unwrap()
}
