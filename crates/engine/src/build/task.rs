use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::command::{Command, CommandStatus};
use crate::error::{EngineError, Result};
use crate::instance::{Instance, InstanceSpec};

pub type TaskId = i64;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Metadata property overriding the task timeout.
pub const TIMEOUT_PROPERTY: &str = "timeout_in";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    New,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::New)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::New => "new",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// A task as produced by the configuration layer, before it is wrapped into a
/// [`Task`] owned by a build.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "command")]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub instance: Option<InstanceSpec>,
}

pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub depends_on: Vec<TaskId>,
    pub environment: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub timeout: Duration,
    commands: Vec<Command>,
    command_statuses: Vec<Mutex<CommandStatus>>,
    instance: Arc<dyn Instance>,
    status: Mutex<TaskStatus>,
    started_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .field("instance", &self.instance.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(definition: TaskDefinition, instance: Arc<dyn Instance>) -> Result<Self> {
        let timeout = match definition.metadata.get(TIMEOUT_PROPERTY) {
            Some(value) => parse_timeout(value).ok_or_else(|| EngineError::InvalidTimeout {
                task: definition.id,
                value: value.clone(),
            })?,
            None => DEFAULT_TIMEOUT,
        };

        let name = if definition.name.is_empty() {
            format!("task-{}", definition.id)
        } else {
            definition.name
        };

        let command_statuses = definition
            .commands
            .iter()
            .map(|_| Mutex::new(CommandStatus::Undefined))
            .collect();

        Ok(Self {
            id: definition.id,
            name,
            depends_on: definition.depends_on,
            environment: definition.environment,
            metadata: definition.metadata,
            timeout,
            commands: definition.commands,
            command_statuses,
            instance,
            status: Mutex::new(TaskStatus::New),
            started_at: Mutex::new(None),
        })
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn instance(&self) -> &Arc<dyn Instance> {
        &self.instance
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the task out of `New`. Terminal states never change again;
    /// returns whether the transition happened.
    pub fn set_status(&self, status: TaskStatus) -> bool {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_terminal() || !status.is_terminal() {
            return false;
        }
        *current = status;
        true
    }

    pub fn command_status(&self, name: &str) -> Option<CommandStatus> {
        let index = self.command_index(name)?;
        Some(*self.command_statuses[index].lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Records the outcome of a command. Set at most once.
    pub fn set_command_status(&self, name: &str, status: CommandStatus) -> bool {
        let Some(index) = self.command_index(name) else {
            return false;
        };
        let mut current = self.command_statuses[index]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *current != CommandStatus::Undefined {
            return false;
        }
        *current = status;
        true
    }

    pub fn command_index(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|command| command.name == name)
    }

    /// The command following `name` in the canonical command list.
    pub fn next_command_after(&self, name: &str) -> Option<&Command> {
        let index = self.command_index(name)?;
        self.commands.get(index + 1)
    }

    pub fn mark_started(&self) {
        let mut started_at = self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        started_at.get_or_insert_with(Instant::now);
    }

    pub fn remaining_timeout(&self) -> Duration {
        let started_at = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        match started_at {
            Some(started_at) => self.timeout.saturating_sub(started_at.elapsed()),
            None => self.timeout,
        }
    }
}

/// Parses `"90"`, `"90s"`, `"30m"` or `"2h"`.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last()? {
        (i, 's') => (&value[..i], 1),
        (i, 'm') => (&value[..i], 60),
        (i, 'h') => (&value[..i], 60 * 60),
        _ => (value, 1),
    };

    let amount: u64 = digits.trim().parse().ok()?;
    if amount == 0 {
        return None;
    }
    Some(Duration::from_secs(amount.checked_mul(multiplier)?))
}
