use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::DockerSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceLimits {
    pub cpu_cores: Option<f64>,
    pub memory_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn new(cpu: Option<f64>, memory_mb: Option<u64>) -> Self {
        Self {
            cpu_cores: cpu,
            memory_bytes: memory_mb.map(megabytes),
        }
    }

    /// Fills unset limits from the engine-wide Docker defaults.
    pub fn or_defaults(self, settings: &DockerSettings) -> Self {
        Self {
            cpu_cores: self.cpu_cores.or(Some(settings.default_cpu)),
            memory_bytes: self
                .memory_bytes
                .or(Some(megabytes(settings.default_memory_mb))),
        }
    }

    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpu_cores.map(|c| (c * 1_000_000_000.0) as i64)
    }

    pub fn memory(&self) -> Option<i64> {
        self.memory_bytes
            .map(|m| i64::try_from(m).unwrap_or(i64::MAX))
    }
}

fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerSpec {
    pub image: String,
    pub cpu: Option<f64>,
    pub memory_mb: Option<u64>,
    /// Sidecars sharing the main container's network namespace.
    #[serde(default)]
    pub additional_containers: Vec<AdditionalContainerSpec>,
    /// Overrides the working directory inside the container.
    pub working_directory: Option<String>,
}

impl ContainerSpec {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.cpu, self.memory_mb)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdditionalContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub cpu: Option<f64>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipeSpec {
    pub cpu: Option<f64>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrebuiltSpec {
    /// Repository the built image is tagged under.
    pub image: String,
    /// Dockerfile path, relative to the project directory.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Build context, relative to the project directory.
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistentWorkerSpec {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Runs the task in this directory instead of a fresh temporary one.
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VmSpec {
    #[serde(default)]
    pub image: String,
}
