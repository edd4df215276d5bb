use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Property naming the container image a command runs in (pipe stages).
pub const IMAGE_PROPERTY: &str = "image";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Command {
    pub name: String,
    #[serde(flatten)]
    pub instruction: Instruction,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    Clone,
    Script {
        scripts: Vec<String>,
    },
    BackgroundScript {
        scripts: Vec<String>,
    },
    Cache {
        folder: String,
        #[serde(default)]
        fingerprint_scripts: Vec<String>,
        #[serde(default)]
        populate_scripts: Vec<String>,
    },
    UploadCache {
        cache_name: String,
    },
    Artifacts {
        paths: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Undefined,
    Success,
    Failure,
}

impl Command {
    pub fn script(name: impl Into<String>, scripts: &[&str]) -> Self {
        Self {
            name: name.into(),
            instruction: Instruction::Script {
                scripts: scripts.iter().map(|s| s.to_string()).collect(),
            },
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn image(&self) -> Option<&str> {
        self.properties
            .get(IMAGE_PROPERTY)
            .map(String::as_str)
            .filter(|image| !image.is_empty())
    }

    pub fn is_clone(&self) -> bool {
        matches!(self.instruction, Instruction::Clone)
    }
}
