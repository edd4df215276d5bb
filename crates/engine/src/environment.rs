use std::collections::HashMap;
use std::path::Path;

use crate::build::Task;

/// Merges environment maps in order; a key in a later map replaces the same
/// key from an earlier one.
pub fn merge_environments<'a, I>(sources: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a HashMap<String, String>>,
{
    let mut merged = HashMap::new();
    for source in sources {
        for (key, value) in source {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Variables every task sees, before its own environment and overrides.
pub fn static_environment(
    build_id: &str,
    task: &Task,
    working_dir: &Path,
    project_dir: &Path,
) -> HashMap<String, String> {
    let mut environment = HashMap::new();
    environment.insert("CI".to_string(), "true".to_string());
    environment.insert("CIRRUS_CI".to_string(), "true".to_string());
    environment.insert("CIRRUS_BUILD_ID".to_string(), build_id.to_string());
    environment.insert("CIRRUS_TASK_ID".to_string(), task.id.to_string());
    environment.insert("CIRRUS_TASK_NAME".to_string(), task.name.clone());
    environment.insert(
        "CIRRUS_WORKING_DIR".to_string(),
        working_dir.to_string_lossy().to_string(),
    );
    environment.insert(
        "CIRRUS_PROJECT_DIR".to_string(),
        project_dir.to_string_lossy().to_string(),
    );
    environment
}

/// Full environment handed to the agent for `task`.
pub fn task_environment(
    build_id: &str,
    task: &Task,
    build_project_dir: &Path,
    dirty_mode: bool,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let instance = task.instance();
    let working_dir = instance.working_directory(build_project_dir, dirty_mode);
    let project_dir = instance.project_directory(build_project_dir, dirty_mode);

    let base = static_environment(build_id, task, &working_dir, &project_dir);
    merge_environments([&base, &task.environment, overrides])
}
