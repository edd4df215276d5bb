use anyhow::{bail, Context, Result};
use bollard::container::{Config, LogOutput, LogsOptions, RemoveContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::cleanup::PendingCleanups;
use crate::config::DockerSettings;

/// Mount point of the per-task working volume.
pub const VOLUME_MOUNT: &str = "/tmp/cirrus-ci";
pub const CONTAINER_PROJECT_DIR: &str = "/tmp/cirrus-ci/project";
pub const CONTAINER_WORKING_DIR: &str = "/tmp/cirrus-ci/build";
pub const CONTAINER_AGENT_PATH: &str = "/tmp/cirrus-ci/agent";

/// Lets containers reach the RPC server listening on the host.
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal:host-gateway";

pub async fn connect(settings: &DockerSettings) -> Result<Docker> {
    let docker = if let Some(socket) = &settings.socket_path {
        Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker socket")?
    } else {
        Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?
    };

    docker
        .ping()
        .await
        .context("Failed to ping Docker daemon")?;

    Ok(docker)
}

pub async fn image_exists(docker: &Docker, image: &str) -> bool {
    docker.inspect_image(image).await.is_ok()
}

/// Pulls `image` unless it is already present locally.
pub async fn ensure_image(docker: &Docker, image: &str, always_pull: bool) -> Result<()> {
    if !always_pull && image_exists(docker, image).await {
        tracing::debug!("Image {} is available locally", image);
        return Ok(());
    }
    pull_image(docker, image).await
}

pub async fn pull_image(docker: &Docker, image: &str) -> Result<()> {
    tracing::info!("Pulling Docker image: {}", image);

    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(result) = stream.next().await {
        let info = result.with_context(|| format!("Failed to pull image {}", image))?;
        if let Some(progress) = info.progress {
            tracing::trace!("Pull progress: {}", progress);
        }
        if let Some(status) = info.status {
            tracing::debug!("Pull status: {}", status);
        }
    }

    tracing::info!("Image pulled successfully: {}", image);
    Ok(())
}

/// Containers and volumes created for one task, released in reverse order of
/// creation.
pub struct DockerResources {
    docker: Docker,
    containers: Vec<String>,
    volumes: Vec<String>,
}

pub type SharedResources = Arc<Mutex<DockerResources>>;

impl DockerResources {
    pub fn shared(docker: Docker) -> SharedResources {
        Arc::new(Mutex::new(Self {
            docker,
            containers: Vec::new(),
            volumes: Vec::new(),
        }))
    }

    pub async fn create_volume(&mut self, name: &str) -> Result<String> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to create volume {}", name))?;
        self.volumes.push(volume.name.clone());
        Ok(volume.name)
    }

    pub async fn start_container(&mut self, config: Config<String>) -> Result<String> {
        let container = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .context("Failed to create container")?;
        self.containers.push(container.id.clone());

        self.docker
            .start_container::<String>(&container.id, None)
            .await
            .context("Failed to start container")?;

        tracing::debug!("Started container: {}", container.id);
        Ok(container.id)
    }

    pub async fn release(&mut self) {
        while let Some(id) = self.containers.pop() {
            if let Err(e) = self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!("Failed to remove container {}: {}", id, e);
            }
        }
        while let Some(name) = self.volumes.pop() {
            if let Err(e) = self
                .docker
                .remove_volume(&name, Some(RemoveVolumeOptions { force: true }))
                .await
            {
                tracing::warn!("Failed to remove volume {}: {}", name, e);
            }
        }
    }
}

/// Releases `resources` through `pending` if the owning future is dropped
/// before it released them itself. Defuse it with `ScopeGuard::into_inner`
/// once the resources were released inline.
pub fn cleanup_guard(
    resources: SharedResources,
    pending: PendingCleanups,
) -> scopeguard::ScopeGuard<SharedResources, impl FnOnce(SharedResources)> {
    scopeguard::guard(resources, move |resources| {
        pending.spawn(async move {
            resources.lock().await.release().await;
        });
    })
}

pub async fn wait_for_exit(docker: &Docker, id: &str) -> Result<i64> {
    let mut stream = docker.wait_container::<String>(id, None);
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e).with_context(|| format!("Failed to wait for container {}", id)),
        None => bail!("Container {} wait stream ended unexpectedly", id),
    }
}

/// Forwards the container's output to `tracing` until it exits.
pub fn forward_logs(docker: Docker, id: String, label: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = docker.logs(&id, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message }
                    | LogOutput::StdIn { message },
                ) => {
                    for line in String::from_utf8_lossy(&message).lines() {
                        tracing::debug!(target: "container", "[{}] {}", label, line);
                    }
                }
                Err(e) => {
                    tracing::debug!("Stopped following logs of {}: {}", id, e);
                    break;
                }
            }
        }
    })
}

/// Seeds `volume` with the agent binary and, unless the project is bind
/// mounted directly, a copy of the project.
pub async fn populate_volume(
    docker: &Docker,
    resources: &SharedResources,
    settings: &DockerSettings,
    volume: &str,
    project_dir: Option<&Path>,
    agent_path: &Path,
) -> Result<()> {
    ensure_image(docker, &settings.helper_image, false).await?;

    let mut binds = vec![
        format!("{}:{}", volume, VOLUME_MOUNT),
        format!("{}:/agent-src/agent:ro", agent_path.display()),
    ];
    let mut script = format!(
        "mkdir -p {work} && cp /agent-src/agent {agent} && chmod +x {agent}",
        work = CONTAINER_WORKING_DIR,
        agent = CONTAINER_AGENT_PATH,
    );
    if let Some(project_dir) = project_dir {
        binds.push(format!("{}:/project-src:ro", project_dir.display()));
        script.push_str(&format!(
            " && mkdir -p {project} && cp -R /project-src/. {project}",
            project = CONTAINER_PROJECT_DIR,
        ));
    }

    let config = Config {
        image: Some(settings.helper_image.clone()),
        cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        host_config: Some(HostConfig {
            binds: Some(binds),
            ..Default::default()
        }),
        ..Default::default()
    };

    let id = resources.lock().await.start_container(config).await?;
    let exit_code = wait_for_exit(docker, &id).await?;
    if exit_code != 0 {
        bail!("Preparing volume {} failed with exit code {}", volume, exit_code);
    }

    tracing::debug!("Volume {} is ready", volume);
    Ok(())
}

pub fn volume_name(task_id: i64) -> String {
    format!("localci-task-{}-{}", task_id, uuid::Uuid::new_v4().simple())
}

pub fn environment_list(environment: &std::collections::HashMap<String, String>) -> Vec<String> {
    let mut list: Vec<String> = environment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    list.sort();
    list
}
