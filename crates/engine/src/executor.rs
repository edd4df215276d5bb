use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::build::{Build, TaskDefinition, TaskId, TaskStatus};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::instance::{InstanceFactory, RunConfig};
use crate::rpc::{RpcOptions, RpcServer};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub rpc: RpcOptions,
    pub agent_version: String,
    pub dirty_mode: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            rpc: RpcOptions::from_config(config),
            agent_version: config.agent.version.clone(),
            dirty_mode: config.dirty_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub build_id: String,
    /// Attempted tasks, in execution order.
    pub outcomes: Vec<TaskOutcome>,
    /// Task whose unsuccessful outcome stopped the build.
    pub halted_by: Option<TaskId>,
    /// Tasks that were never attempted.
    pub pending: Vec<TaskId>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.halted_by.is_none()
            && self.pending.is_empty()
            && self
                .outcomes
                .iter()
                .all(|outcome| outcome.status == TaskStatus::Succeeded)
    }

    pub fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.id == id)
            .map(|outcome| outcome.status)
    }
}

/// Runs the tasks of one build, one at a time, in dependency order.
pub struct Executor {
    build: Arc<Build>,
    rpc: RpcServer,
    options: ExecutorOptions,
}

impl Executor {
    /// Starts the RPC server for `build`.
    pub async fn new(build: Build, options: ExecutorOptions) -> Result<Self> {
        let build = Arc::new(build);
        let rpc = RpcServer::start(build.clone(), options.rpc.clone()).await?;
        Ok(Self {
            build,
            rpc,
            options,
        })
    }

    pub async fn from_definitions(
        config: &EngineConfig,
        project_dir: &Path,
        definitions: Vec<TaskDefinition>,
    ) -> Result<Self> {
        let factory = InstanceFactory::new(config);
        let build = Build::new(project_dir, definitions, &factory, &config.cache_dir).await?;
        Self::new(build, ExecutorOptions::from_config(config)).await
    }

    pub fn build(&self) -> &Arc<Build> {
        &self.build
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    /// Runs until no task is runnable or a task does not succeed. A
    /// provisioning failure aborts the run with an error. The RPC server is
    /// stopped on every path.
    pub async fn run(mut self) -> Result<RunReport> {
        let result = self.run_tasks().await;

        if let Err(e) = self.rpc.stop().await {
            tracing::warn!("Failed to stop RPC server: {}", e);
        }
        for task in self.build.tasks() {
            if let Err(e) = task.instance().close().await {
                tracing::warn!("Failed to close instance of task {}: {:#}", task.id, e);
            }
        }

        result
    }

    async fn run_tasks(&self) -> Result<RunReport> {
        let mut outcomes = Vec::new();
        let mut halted_by = None;

        while let Some(task) = self.build.get_next_task() {
            task.mark_started();
            let instance = task.instance().clone();
            let config = RunConfig {
                project_dir: self.build.project_dir().to_path_buf(),
                container_endpoint: self.rpc.container_endpoint(),
                direct_endpoint: self.rpc.direct_endpoint(),
                server_secret: self.rpc.server_secret().to_string(),
                client_secret: self.rpc.client_secret().to_string(),
                task_id: task.id,
                agent_version: self.options.agent_version.clone(),
                dirty_mode: self.options.dirty_mode,
            };

            let span = tracing::info_span!("task", id = task.id, name = %task.name);
            let started = Instant::now();
            let result = async {
                tracing::info!("Starting task on a {} instance", instance.kind());
                tokio::time::timeout(task.timeout, instance.run(&config)).await
            }
            .instrument(span.clone())
            .await;

            match result {
                Ok(Ok(())) => {
                    if !instance.launches_agent() {
                        task.set_status(TaskStatus::Succeeded);
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(parent: &span, "Task could not be executed: {:#}", e);
                    return Err(e.downcast::<EngineError>().unwrap_or_else(EngineError::Other));
                }
                Err(_) => {
                    task.set_status(TaskStatus::TimedOut);
                }
            }

            // An agent that exits without reporting its last command failed.
            if task.set_status(TaskStatus::Failed) {
                tracing::warn!(parent: &span, "Agent finished without completing the task");
            }

            let status = task.status();
            let duration = started.elapsed();
            tracing::info!(parent: &span, "Task {} in {:.2}s", status, duration.as_secs_f64());
            outcomes.push(TaskOutcome {
                id: task.id,
                name: task.name.clone(),
                status,
                duration,
            });

            if status != TaskStatus::Succeeded {
                halted_by = Some(task.id);
                break;
            }
        }

        let pending: Vec<TaskId> = self
            .build
            .tasks()
            .filter(|task| task.status() == TaskStatus::New)
            .map(|task| task.id)
            .collect();
        if halted_by.is_none() && !pending.is_empty() {
            tracing::warn!("Tasks {:?} can never run: their dependencies did not succeed", pending);
        }

        Ok(RunReport {
            build_id: self.build.id().to_string(),
            outcomes,
            halted_by,
            pending,
        })
    }
}
