use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::build::TaskId;
use crate::util::sanitize_key;

/// Destination of one command's log output: `tracing` events under the
/// `agent_log` target, plus an optional file.
pub struct LogSink {
    task_id: TaskId,
    command_name: String,
    file: Option<File>,
    pending: Vec<u8>,
}

impl LogSink {
    pub async fn open(
        logs_dir: Option<&Path>,
        task_id: TaskId,
        command_name: &str,
    ) -> std::io::Result<Self> {
        let file = match logs_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_file_path(dir, task_id, command_name))
                    .await?;
                Some(file)
            }
            None => None,
        };

        Ok(Self {
            task_id,
            command_name: command_name.to_string(),
            file,
            pending: Vec::new(),
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
        }

        self.pending.extend_from_slice(data);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(())
    }

    pub async fn finish(mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest);
        }
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        tracing::info!(
            target: "agent_log",
            task = self.task_id,
            command = %self.command_name,
            "{}",
            line.trim_end_matches('\r')
        );
    }
}

pub fn log_file_path(logs_dir: &Path, task_id: TaskId, command_name: &str) -> PathBuf {
    logs_dir.join(format!("{}-{}.log", task_id, sanitize_key(command_name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_log_file() {
        let temp_dir = TempDir::new().unwrap();
        let logs_dir = temp_dir.path().join("logs");

        let mut sink = LogSink::open(Some(&logs_dir), 4, "build").await.unwrap();
        sink.write(b"compiling\npartial").await.unwrap();
        sink.write(b" line\n").await.unwrap();
        sink.finish().await.unwrap();

        let contents = std::fs::read_to_string(logs_dir.join("4-build.log")).unwrap();
        assert_eq!(contents, "compiling\npartial line\n");
    }

    #[test]
    fn test_unsafe_command_names_are_hashed() {
        let path = log_file_path(Path::new("/logs"), 1, "../escape");
        assert_eq!(path.parent(), Some(Path::new("/logs")));
        assert!(!path.to_string_lossy().contains(".."));
    }
}
