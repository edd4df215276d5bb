use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{Instance, RunConfig};
use crate::error::EngineError;

/// Stand-in for instance kinds the local executor cannot run. Construction
/// always succeeds so the build stays valid; the task fails once scheduled.
#[derive(Debug, Clone)]
pub struct UnsupportedInstance {
    message: String,
}

impl UnsupportedInstance {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Instance for UnsupportedInstance {
    async fn run(&self, _config: &RunConfig) -> anyhow::Result<()> {
        Err(EngineError::UnsupportedInstance(self.message.clone()).into())
    }

    fn working_directory(&self, project_dir: &Path, _dirty_mode: bool) -> PathBuf {
        project_dir.to_path_buf()
    }

    fn kind(&self) -> &'static str {
        "unsupported"
    }
}
