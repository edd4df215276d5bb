use anyhow::{bail, Context, Result};
use localci_engine::{EngineConfig, TaskDefinition};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default, rename = "task")]
    tasks: Vec<TaskDefinition>,
}

pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::from_file(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

pub fn find_default_config() -> Option<PathBuf> {
    let mut locations = vec![
        std::env::current_dir().ok()?.join("localci.toml"),
        std::env::current_dir().ok()?.join(".localci.toml"),
    ];
    if let Some(home) = home_dir() {
        locations.push(home.join(".config/localci/config.toml"));
    }

    locations.into_iter().find(|p| p.exists())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

pub fn load_task_file(path: &Path) -> Result<Vec<TaskDefinition>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;
    parse_task_file(&contents)
        .with_context(|| format!("Failed to parse task file: {}", path.display()))
}

pub fn parse_task_file(contents: &str) -> Result<Vec<TaskDefinition>> {
    let file: TaskFile = toml::from_str(contents)?;
    if file.tasks.is_empty() {
        bail!("no [[task]] entries");
    }
    Ok(file.tasks)
}

pub fn parse_env_pair(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("Invalid environment override {:?}, expected KEY=VALUE", pair),
    }
}
