pub mod build;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod instance;
pub mod rpc;
pub mod storage;
pub mod util;

pub use build::{Build, Command, CommandStatus, Instruction, Task, TaskDefinition, TaskId, TaskStatus};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use executor::{Executor, ExecutorOptions, RunReport, TaskOutcome};
pub use instance::{Instance, InstanceFactory, InstanceSpec, RunConfig};
pub use rpc::{RpcOptions, RpcServer};
pub use storage::{BlobCache, CacheBlob, FileSystemBlobCache};
