use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::config::AgentSettings;

/// Local cache of agent binaries keyed by `(version, os, arch)`.
///
/// A binary is downloaded at most once per key. Downloads land in a temporary
/// file in the cache directory and are renamed into place, so a concurrent
/// resolver either sees the complete binary or nothing.
pub struct AgentCache {
    settings: AgentSettings,
    client: reqwest::Client,
    download_lock: Mutex<()>,
}

impl AgentCache {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
            download_lock: Mutex::new(()),
        }
    }

    pub fn binary_path(&self, version: &str, os: &str, arch: &str) -> PathBuf {
        self.settings
            .cache_dir
            .join(version)
            .join(binary_name(os, arch))
    }

    pub fn download_url(&self, version: &str, os: &str, arch: &str) -> String {
        format!(
            "{}/v{}/{}",
            self.settings.download_base_url.trim_end_matches('/'),
            version,
            binary_name(os, arch)
        )
    }

    /// Agent for the machine this engine runs on.
    pub async fn resolve_host(&self, version: &str) -> Result<PathBuf> {
        self.resolve(version, host_os(), host_arch()).await
    }

    /// Agent for Linux containers on this host's architecture.
    pub async fn resolve_container(&self, version: &str) -> Result<PathBuf> {
        self.resolve(version, "linux", host_arch()).await
    }

    pub async fn resolve(&self, version: &str, os: &str, arch: &str) -> Result<PathBuf> {
        let path = self.binary_path(version, os, arch);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        let _guard = self.download_lock.lock().await;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        let url = self.download_url(version, os, arch);
        tracing::info!("Downloading agent {} for {}/{} from {}", version, os, arch, url);
        self.download(&url, &path).await?;
        Ok(path)
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<()> {
        let dir = destination
            .parent()
            .context("Agent destination has no parent directory")?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create agent cache directory {:?}", dir))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;
        if !response.status().is_success() {
            bail!("Agent download from {} failed with HTTP {}", url, response.status());
        }

        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary agent file")?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Agent download interrupted")?;
            temp.write_all(&chunk)?;
        }
        temp.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o755))?;
        }

        if let Err(e) = temp.persist(destination) {
            // Another process may have won the race.
            if !destination.exists() {
                return Err(e.error).context("Failed to move agent binary into place");
            }
        }

        tracing::debug!("Agent stored at {:?}", destination);
        Ok(())
    }
}

fn binary_name(os: &str, arch: &str) -> String {
    if os == "windows" {
        format!("agent-{}-{}.exe", os, arch)
    } else {
        format!("agent-{}-{}", os, arch)
    }
}

pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
