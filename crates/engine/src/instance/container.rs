use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::HostConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::agent::AgentCache;
use super::cleanup::PendingCleanups;
use super::docker::{self, DockerResources, CONTAINER_AGENT_PATH, CONTAINER_PROJECT_DIR};
use super::{ContainerSpec, Instance, RunConfig};
use crate::config::DockerSettings;

/// Runs the agent inside a single container, with optional sidecars.
pub struct ContainerInstance {
    spec: ContainerSpec,
    settings: DockerSettings,
    agent_cache: Arc<AgentCache>,
    pending: PendingCleanups,
}

impl ContainerInstance {
    pub fn new(spec: ContainerSpec, settings: DockerSettings, agent_cache: Arc<AgentCache>) -> Self {
        Self {
            spec,
            settings,
            agent_cache,
            pending: PendingCleanups::default(),
        }
    }

    fn working_dir_in_container(&self) -> String {
        self.spec
            .working_directory
            .clone()
            .unwrap_or_else(|| docker::CONTAINER_WORKING_DIR.to_string())
    }

    fn main_config(&self, config: &RunConfig, volume: &str) -> Config<String> {
        let working_dir = self.working_dir_in_container();
        let limits = self.spec.limits().or_defaults(&self.settings);

        let mut binds = vec![format!("{}:{}", volume, docker::VOLUME_MOUNT)];
        if config.dirty_mode {
            binds.push(format!("{}:{}", config.project_dir.display(), working_dir));
        }

        let mut cmd = vec![CONTAINER_AGENT_PATH.to_string()];
        cmd.extend(config.agent_args(&config.container_endpoint));

        Config {
            image: Some(self.spec.image.clone()),
            entrypoint: Some(vec![]),
            cmd: Some(cmd),
            working_dir: Some(working_dir),
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
impl Instance for ContainerInstance {
    async fn run(&self, config: &RunConfig) -> Result<()> {
        let docker = docker::connect(&self.settings).await?;
        docker::ensure_image(&docker, &self.spec.image, self.settings.always_pull).await?;
        for sidecar in &self.spec.additional_containers {
            docker::ensure_image(&docker, &sidecar.image, self.settings.always_pull).await?;
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

            let main_id = resources
                .lock()
                .await
                .start_container(self.main_config(config, &volume))
                .await?;
            tracing::info!(
                "Task {} running in container {} ({})",
                config.task_id,
                main_id,
                self.spec.image
            );
            let logs = docker::forward_logs(
                docker.clone(),
                main_id.clone(),
                format!("task-{}", config.task_id),
            );

            for sidecar in &self.spec.additional_containers {
                let limits = super::ResourceLimits::new(sidecar.cpu, sidecar.memory_mb);
                let sidecar_config = Config {
                    image: Some(sidecar.image.clone()),
                    cmd: (!sidecar.command.is_empty()).then(|| sidecar.command.clone()),
                    env: Some(docker::environment_list(&sidecar.environment)),
                    host_config: Some(HostConfig {
                        network_mode: Some(format!("container:{}", main_id)),
                        nano_cpus: limits.nano_cpus(),
                        memory: limits.memory(),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                let id = resources.lock().await.start_container(sidecar_config).await?;
                tracing::debug!("Sidecar {} started as {}", sidecar.name, id);
            }

            let exit_code = docker::wait_for_exit(&docker, &main_id).await?;
            logs.abort();
            if exit_code != 0 {
                tracing::warn!("Agent container for task {} exited with {}", config.task_id, exit_code);
            }
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
        PathBuf::from(self.working_dir_in_container())
    }

    fn project_directory(&self, _project_dir: &Path, dirty_mode: bool) -> PathBuf {
        if dirty_mode {
            PathBuf::from(self.working_dir_in_container())
        } else {
            PathBuf::from(CONTAINER_PROJECT_DIR)
        }
    }

    fn kind(&self) -> &'static str {
        "container"
    }
}
