pub mod command;
pub mod task;

pub use command::{Command, CommandStatus, Instruction, IMAGE_PROPERTY};
pub use task::{parse_timeout, Task, TaskDefinition, TaskId, TaskStatus, DEFAULT_TIMEOUT};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EngineError, Result};
use crate::instance::{Instance, InstanceFactory};
use crate::storage::{DynBlobCache, FileSystemBlobCache};
use crate::util::constant_time_eq;

/// Script replacing the clone instruction: the engine runs against a local
/// checkout, so "cloning" means copying the project directory into the
/// working directory unless both already point at the same place.
pub const CLONE_SCRIPT: &str = r#"if [ "$CIRRUS_PROJECT_DIR" != "$CIRRUS_WORKING_DIR" ]; then cp -R "$CIRRUS_PROJECT_DIR/." .; fi"#;

pub struct Build {
    id: String,
    project_dir: PathBuf,
    tasks: BTreeMap<TaskId, Arc<Task>>,
    cache: DynBlobCache,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("id", &self.id)
            .field("project_dir", &self.project_dir)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Build {
    pub async fn new(
        project_dir: impl AsRef<Path>,
        definitions: Vec<TaskDefinition>,
        factory: &InstanceFactory,
        cache_dir: &Path,
    ) -> Result<Self> {
        let mut tasks = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let instance = factory.create(&definition)?;
            tasks.push((definition, instance));
        }
        Self::with_instances(project_dir, tasks, cache_dir).await
    }

    /// Builds from definitions whose instances were already selected.
    pub async fn with_instances(
        project_dir: impl AsRef<Path>,
        tasks: Vec<(TaskDefinition, Arc<dyn Instance>)>,
        cache_dir: &Path,
    ) -> Result<Self> {
        let project_dir = std::fs::canonicalize(project_dir.as_ref())?;

        let mut by_id = BTreeMap::new();
        for (mut definition, instance) in tasks {
            intercept_clone(&mut definition.commands);

            let id = definition.id;
            let task = Task::new(definition, instance)?;
            if by_id.insert(id, Arc::new(task)).is_some() {
                return Err(EngineError::DuplicateTask(id));
            }
        }

        for task in by_id.values() {
            for dependency in &task.depends_on {
                if !by_id.contains_key(dependency) {
                    return Err(EngineError::DanglingDependency {
                        task: task.id,
                        dependency: *dependency,
                    });
                }
            }
        }

        let namespace = project_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string());
        let cache = FileSystemBlobCache::namespaced(cache_dir, &namespace);
        cache.init().await?;

        tracing::info!(
            "Build of {:?} with {} tasks, cache at {:?}",
            project_dir,
            by_id.len(),
            cache.root_dir()
        );

        Ok(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            project_dir,
            tasks: by_id,
            cache: Arc::new(cache),
            lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn cache(&self) -> &DynBlobCache {
        &self.cache
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values()
    }

    pub fn get_task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.get(&id).cloned()
    }

    /// Serialises read-decide-write sequences over task state.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_task_from_identification(
        &self,
        task_id: TaskId,
        secret: &str,
        expected_secret: &str,
    ) -> Result<Arc<Task>> {
        if !constant_time_eq(secret, expected_secret) {
            return Err(EngineError::Unauthenticated(task_id));
        }
        self.get_task(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Lowest-ID task that is still `New` and whose dependencies all
    /// succeeded. A dependency that failed or timed out keeps its dependents
    /// blocked forever, as does a dependency cycle.
    pub fn get_next_task(&self) -> Option<Arc<Task>> {
        self.tasks
            .values()
            .find(|task| {
                task.status() == TaskStatus::New
                    && task.depends_on.iter().all(|dependency| {
                        self.tasks
                            .get(dependency)
                            .map(|dep| dep.status() == TaskStatus::Succeeded)
                            .unwrap_or(false)
                    })
            })
            .cloned()
    }
}

fn intercept_clone(commands: &mut [Command]) {
    if let Some(command) = commands.iter_mut().find(|command| command.is_clone()) {
        command.instruction = Instruction::Script {
            scripts: vec![CLONE_SCRIPT.to_string()],
        };
    }
}
