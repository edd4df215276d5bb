use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::oneshot;

use super::agent::AgentCache;
use super::cleanup::PendingCleanups;
use super::{Instance, PersistentWorkerSpec, RunConfig};

/// Runs the agent as a child process on this machine.
pub struct PersistentWorkerInstance {
    agent_cache: Arc<AgentCache>,
    scratch_dir: PathBuf,
    pending: PendingCleanups,
}

impl PersistentWorkerInstance {
    pub fn new(spec: PersistentWorkerSpec, agent_cache: Arc<AgentCache>) -> Self {
        let scratch_dir = spec.working_directory.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("localci-task-{}", uuid::Uuid::new_v4().simple()))
        });
        Self {
            agent_cache,
            scratch_dir,
            pending: PendingCleanups::default(),
        }
    }

    /// Copies the project into the scratch directory on a blocking thread.
    /// The copy stops once `cancelled` is set and then removes what it wrote
    /// if the directory is its own.
    async fn prepare_scratch(
        &self,
        project_dir: &Path,
        created: bool,
        cancelled: Arc<AtomicBool>,
    ) -> Result<()> {
        let source = project_dir.to_path_buf();
        let destination = self.scratch_dir.clone();
        let (done, copied) = oneshot::channel();

        let copy = tokio::task::spawn_blocking(move || {
            let result = std::fs::create_dir_all(&destination)
                .with_context(|| format!("Failed to create {:?}", destination))
                .and_then(|_| copy_dir(&source, &destination, &cancelled));
            if created && cancelled.load(Ordering::SeqCst) {
                remove_scratch(&destination);
            }
            let _ = done.send(result);
        });
        self.pending.track(copy);

        copied.await.context("Project copy panicked")?
    }
}

#[async_trait]
impl Instance for PersistentWorkerInstance {
    async fn run(&self, config: &RunConfig) -> Result<()> {
        let agent_path = self
            .agent_cache
            .resolve_host(&config.agent_version)
            .await
            .context("Failed to obtain the agent for this host")?;

        let working_dir = self.working_directory(&config.project_dir, config.dirty_mode);
        let created = !config.dirty_mode
            && !tokio::fs::try_exists(&self.scratch_dir).await.unwrap_or(false);
        let cancelled = Arc::new(AtomicBool::new(false));
        let scratch_dir = self.scratch_dir.clone();
        let _scratch = scopeguard::guard(cancelled.clone(), move |cancelled| {
            cancelled.store(true, Ordering::SeqCst);
            if created {
                remove_scratch(&scratch_dir);
            }
        });

        if !config.dirty_mode {
            self.prepare_scratch(&config.project_dir, created, cancelled)
                .await?;
        }

        tracing::info!(
            "Task {} running agent {:?} in {:?}",
            config.task_id,
            agent_path,
            working_dir
        );

        let mut child = TokioCommand::new(&agent_path)
            .args(config.agent_args(&config.direct_endpoint))
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start agent {:?}", agent_path))?;

        let label = format!("task-{}", config.task_id);
        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, label.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, label)));
        }

        let status = child.wait().await.context("Failed to wait for the agent")?;
        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        if !status.success() {
            tracing::warn!("Agent for task {} exited with {}", config.task_id, status);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pending.wait().await;
        Ok(())
    }

    fn working_directory(&self, project_dir: &Path, dirty_mode: bool) -> PathBuf {
        if dirty_mode {
            project_dir.to_path_buf()
        } else {
            self.scratch_dir.clone()
        }
    }

    fn project_directory(&self, project_dir: &Path, dirty_mode: bool) -> PathBuf {
        self.working_directory(project_dir, dirty_mode)
    }

    fn kind(&self) -> &'static str {
        "persistent_worker"
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, label: String) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "agent_process", "[{}] {}", label, line);
    }
}

fn remove_scratch(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {:?}: {}", dir, e),
    }
}

/// Removes whatever sits at `path` without following symlinks.
fn remove_entry(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively copies `source` into `destination`, keeping symlinks as links
/// and replacing entries that already exist there.
fn copy_dir(source: &Path, destination: &Path, cancelled: &AtomicBool) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).min_depth(1).follow_links(false) {
        if cancelled.load(Ordering::SeqCst) {
            bail!("Copy of {:?} was cancelled", source);
        }

        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let is_dir = std::fs::symlink_metadata(&target)
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false);
            if !is_dir {
                remove_entry(&target)?;
                std::fs::create_dir_all(&target)?;
            }
            continue;
        }

        remove_entry(&target).with_context(|| format!("Failed to replace {:?}", target))?;
        if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
        }
    }
    Ok(())
}
