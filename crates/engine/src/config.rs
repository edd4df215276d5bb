use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    #[serde(default)]
    pub dirty_mode: bool,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc: RpcSettings::default(),
            agent: AgentSettings::default(),
            docker: DockerSettings::default(),
            cache_dir: default_cache_dir(),
            artifacts_dir: None,
            logs_dir: None,
            dirty_mode: false,
            environment: HashMap::new(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("localci-cache")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcSettings {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_container_host_alias")]
    pub container_host_alias: String,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            container_host_alias: default_container_host_alias(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_container_host_alias() -> String {
    "host.docker.internal".to_string()
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

impl RpcSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_version")]
    pub version: String,
    #[serde(default = "default_agent_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            version: default_agent_version(),
            cache_dir: default_agent_cache_dir(),
            download_base_url: default_download_base_url(),
        }
    }
}

fn default_agent_version() -> String {
    "1.140.0".to_string()
}

fn default_agent_cache_dir() -> PathBuf {
    std::env::temp_dir().join("localci-agent")
}

fn default_download_base_url() -> String {
    "https://github.com/cirruslabs/cirrus-ci-agent/releases/download".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerSettings {
    pub socket_path: Option<String>,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default = "default_cpu")]
    pub default_cpu: f64,
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u64,
    #[serde(default)]
    pub always_pull: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            helper_image: default_helper_image(),
            default_cpu: default_cpu(),
            default_memory_mb: default_memory_mb(),
            always_pull: false,
        }
    }
}

fn default_helper_image() -> String {
    "alpine:latest".to_string()
}

fn default_cpu() -> f64 {
    2.0
}

fn default_memory_mb() -> u64 {
    4096
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
