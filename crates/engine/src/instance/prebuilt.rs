use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::image::BuildImageOptions;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::docker;
use super::{Instance, PrebuiltSpec, RunConfig};
use crate::config::DockerSettings;
use crate::error::{EngineError, Result as EngineResult};

/// Builds an image from a Dockerfile in the project. The image tag is derived
/// from the Dockerfile and build arguments, so an unchanged definition reuses
/// the image built last time.
pub struct PrebuiltInstance {
    spec: PrebuiltSpec,
    settings: DockerSettings,
}

impl PrebuiltInstance {
    pub fn new(spec: PrebuiltSpec, settings: DockerSettings) -> EngineResult<Self> {
        if spec.image.is_empty() {
            return Err(EngineError::InvalidInstance(
                "prebuilt instance needs an image repository".to_string(),
            ));
        }
        Ok(Self { spec, settings })
    }

    pub async fn image_tag(&self, project_dir: &Path) -> Result<String> {
        let dockerfile = project_dir.join(&self.spec.dockerfile);
        let contents = tokio::fs::read(&dockerfile)
            .await
            .with_context(|| format!("Failed to read {:?}", dockerfile))?;
        Ok(content_tag(&self.spec.image, &contents, &self.spec.arguments))
    }

    async fn build(&self, docker: &bollard::Docker, project_dir: &Path, tag: &str) -> Result<()> {
        let context_dir = project_dir.join(&self.spec.context);
        let dockerfile = project_dir.join(&self.spec.dockerfile);
        let dockerfile_in_context = dockerfile
            .strip_prefix(&context_dir)
            .with_context(|| {
                format!(
                    "Dockerfile {:?} lies outside the build context {:?}",
                    dockerfile, context_dir
                )
            })?
            .to_string_lossy()
            .to_string();

        let archive = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.follow_symlinks(false);
            builder
                .append_dir_all(".", &context_dir)
                .with_context(|| format!("Failed to archive build context {:?}", context_dir))?;
            Ok(builder.into_inner()?)
        })
        .await
        .context("Build context archiver panicked")??;

        tracing::info!("Building image {} ({} byte context)", tag, archive.len());

        let options = BuildImageOptions {
            dockerfile: dockerfile_in_context,
            t: tag.to_string(),
            buildargs: self.spec.arguments.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(archive.into()));
        while let Some(result) = stream.next().await {
            let info = result.with_context(|| format!("Failed to build image {}", tag))?;
            if let Some(error) = info.error {
                bail!("Failed to build image {}: {}", tag, error);
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(target: "docker_build", "{}", line);
                }
            }
        }

        tracing::info!("Image built: {}", tag);
        Ok(())
    }
}

/// `<repository>:<sha256 of the Dockerfile and sorted build arguments>`
pub fn content_tag(
    repository: &str,
    dockerfile: &[u8],
    arguments: &HashMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile);
    let sorted: BTreeMap<_, _> = arguments.iter().collect();
    for (key, value) in sorted {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{}:{}", repository, hex::encode(hasher.finalize()))
}

#[async_trait]
impl Instance for PrebuiltInstance {
    async fn run(&self, config: &RunConfig) -> Result<()> {
        let docker = docker::connect(&self.settings).await?;
        let tag = self.image_tag(&config.project_dir).await?;

        if docker::image_exists(&docker, &tag).await {
            tracing::info!("Reusing image {}", tag);
            return Ok(());
        }

        match docker::pull_image(&docker, &tag).await {
            Ok(()) => return Ok(()),
            Err(e) => tracing::debug!("Image {} is not available remotely: {:#}", tag, e),
        }

        self.build(&docker, &config.project_dir, &tag).await
    }

    fn working_directory(&self, project_dir: &Path, _dirty_mode: bool) -> PathBuf {
        project_dir.to_path_buf()
    }

    fn launches_agent(&self) -> bool {
        false
    }

    fn kind(&self) -> &'static str {
        "prebuilt"
    }
}
