use thiserror::Error;

use crate::build::TaskId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Duplicate task ID: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: TaskId, dependency: TaskId },

    #[error("Invalid timeout {value:?} for task {task}")]
    InvalidTimeout { task: TaskId, value: String },

    #[error("Invalid instance configuration: {0}")]
    InvalidInstance(String),

    #[error("Unsupported instance: {0}")]
    UnsupportedInstance(String),

    #[error("Authentication failed for task {0}")]
    Unauthenticated(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Cache entry not found: {0}")]
    CacheEntryNotFound(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<EngineError> for tonic::Status {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unauthenticated(_) => tonic::Status::unauthenticated(err.to_string()),
            EngineError::TaskNotFound(_) | EngineError::CacheEntryNotFound(_) => {
                tonic::Status::not_found(err.to_string())
            }
            EngineError::Protocol(_) => tonic::Status::invalid_argument(err.to_string()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
