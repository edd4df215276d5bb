use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::HostConfig;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::agent::AgentCache;
use super::cleanup::PendingCleanups;
use super::docker::{self, DockerResources, CONTAINER_AGENT_PATH, CONTAINER_PROJECT_DIR};
use super::{Instance, PipeSpec, ResourceLimits, RunConfig};
use crate::build::Command;
use crate::config::DockerSettings;
use crate::error::{EngineError, Result as EngineResult};

/// A contiguous range of commands executed in one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeStage {
    pub image: String,
    pub command_from: String,
    /// First command of the next stage; empty for the last stage.
    pub command_to: String,
}

impl PipeStage {
    pub fn agent_args(&self) -> Vec<String> {
        let mut args = vec!["-command-from".to_string(), self.command_from.clone()];
        if !self.command_to.is_empty() {
            args.push("-command-to".to_string());
            args.push(self.command_to.clone());
        }
        args
    }
}

/// Splits commands into stages at every change of the `image` property.
/// Commands without the property stay in the current stage.
pub fn stages_from_commands(commands: &[Command]) -> EngineResult<Vec<PipeStage>> {
    let first = commands
        .first()
        .ok_or_else(|| EngineError::InvalidInstance("pipe has no commands".to_string()))?;
    let mut image = first.image().ok_or_else(|| {
        EngineError::InvalidInstance(format!(
            "first pipe command {:?} does not declare an image",
            first.name
        ))
    })?;

    let mut stages = Vec::new();
    let mut from = first.name.clone();
    for command in &commands[1..] {
        match command.image() {
            Some(next) if next != image => {
                stages.push(PipeStage {
                    image: image.to_string(),
                    command_from: from,
                    command_to: command.name.clone(),
                });
                image = next;
                from = command.name.clone();
            }
            _ => {}
        }
    }
    stages.push(PipeStage {
        image: image.to_string(),
        command_from: from,
        command_to: String::new(),
    });

    Ok(stages)
}

/// Launches the stages in order and stops after the first one whose agent
/// exits non-zero; the task status tells whether a command failed. Returns
/// how many stages were launched.
async fn run_stages<F, Fut>(stages: &[PipeStage], mut launch: F) -> Result<usize>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<i64>>,
{
    for (index, stage) in stages.iter().enumerate() {
        tracing::info!(
            "Stage {}/{} in {} starting at {:?}",
            index + 1,
            stages.len(),
            stage.image,
            stage.command_from
        );

        let exit_code = launch(index).await?;
        if exit_code != 0 {
            tracing::warn!(
                "Stage {} ({}) exited with {}, skipping the remaining stages",
                index + 1,
                stage.image,
                exit_code
            );
            return Ok(index + 1);
        }
    }
    Ok(stages.len())
}

/// Runs a task as a sequence of containers sharing one working volume.
pub struct PipeInstance {
    spec: PipeSpec,
    stages: Vec<PipeStage>,
    settings: DockerSettings,
    agent_cache: Arc<AgentCache>,
    pending: PendingCleanups,
}

impl PipeInstance {
    pub fn new(
        spec: PipeSpec,
        commands: &[Command],
        settings: DockerSettings,
        agent_cache: Arc<AgentCache>,
    ) -> EngineResult<Self> {
        Ok(Self {
            spec,
            stages: stages_from_commands(commands)?,
            settings,
            agent_cache,
            pending: PendingCleanups::default(),
        })
    }

    fn stage_config(&self, stage: &PipeStage, config: &RunConfig, volume: &str) -> Config<String> {
        let limits =
            ResourceLimits::new(self.spec.cpu, self.spec.memory_mb).or_defaults(&self.settings);

        let mut binds = vec![format!("{}:{}", volume, docker::VOLUME_MOUNT)];
        if config.dirty_mode {
            binds.push(format!(
                "{}:{}",
                config.project_dir.display(),
                docker::CONTAINER_WORKING_DIR
            ));
        }

        let mut cmd = vec![CONTAINER_AGENT_PATH.to_string()];
        cmd.extend(config.agent_args(&config.container_endpoint));
        cmd.extend(stage.agent_args());

        Config {
            image: Some(stage.image.clone()),
            entrypoint: Some(vec![]),
            cmd: Some(cmd),
            working_dir: Some(docker::CONTAINER_WORKING_DIR.to_string()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                extra_hosts: Some(vec![docker::HOST_GATEWAY_ALIAS.to_string()]),
                nano_cpus: limits.nano_cpus(),
                memory: limits.memory(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Instance for PipeInstance {
    async fn run(&self, config: &RunConfig) -> Result<()> {
        let docker = docker::connect(&self.settings).await?;
        for stage in &self.stages {
            docker::ensure_image(&docker, &stage.image, self.settings.always_pull).await?;
        }

        let agent_path = self
            .agent_cache
            .resolve_container(&config.agent_version)
            .await
            .context("Failed to obtain the agent for containers")?;

        let resources = DockerResources::shared(docker.clone());
        let cleanup = docker::cleanup_guard(resources.clone(), self.pending.clone());

        let result = async {
            let volume = resources
                .lock()
                .await
                .create_volume(&docker::volume_name(config.task_id))
                .await?;
            let project_copy = (!config.dirty_mode).then_some(config.project_dir.as_path());
            docker::populate_volume(
                &docker,
                &resources,
                &self.settings,
                &volume,
                project_copy,
                &agent_path,
            )
            .await?;

            let launched = run_stages(&self.stages, |index| {
                let (docker, resources, volume) = (&docker, &resources, &volume);
                async move {
                    let stage = &self.stages[index];
                    let id = resources
                        .lock()
                        .await
                        .start_container(self.stage_config(stage, config, volume))
                        .await?;
                    let logs = docker::forward_logs(
                        docker.clone(),
                        id.clone(),
                        format!("task-{}-stage-{}", config.task_id, index + 1),
                    );
                    let exit_code = docker::wait_for_exit(docker, &id).await;
                    logs.abort();
                    exit_code
                }
            })
            .await?;
            tracing::debug!(
                "Task {} launched {} of {} stages",
                config.task_id,
                launched,
                self.stages.len()
            );
            anyhow::Ok(())
        }
        .await;

        resources.lock().await.release().await;
        scopeguard::ScopeGuard::into_inner(cleanup);
        result
    }

    async fn close(&self) -> Result<()> {
        self.pending.wait().await;
        Ok(())
    }

    fn working_directory(&self, _project_dir: &Path, _dirty_mode: bool) -> PathBuf {
        PathBuf::from(docker::CONTAINER_WORKING_DIR)
    }

    fn project_directory(&self, _project_dir: &Path, dirty_mode: bool) -> PathBuf {
        if dirty_mode {
            PathBuf::from(docker::CONTAINER_WORKING_DIR)
        } else {
            PathBuf::from(CONTAINER_PROJECT_DIR)
        }
    }

    fn kind(&self) -> &'static str {
        "pipe"
    }
}
