use std::collections::HashSet;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Whether an agent-supplied relative path may be written under the
/// artifacts directory.
pub fn is_safe_artifact_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    path.split('/').enumerate().all(|(index, component)| {
        if component.is_empty() || component == "." || component == ".." {
            return false;
        }
        component.char_indices().all(|(position, c)| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | ' ' | '.')
                || (cfg!(windows) && c == ':' && index == 0 && position == 1)
        })
    })
}

/// Writes the chunks of one `UploadArtifacts` stream to
/// `<root>/<artifact name>/<relative path>`. Without a root the data is
/// accepted and dropped.
pub struct ArtifactWriter {
    root: Option<PathBuf>,
    seen: HashSet<(String, String)>,
    bytes_written: u64,
}

impl ArtifactWriter {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            seen: HashSet::new(),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns `false` when the path was skipped as unsafe.
    pub async fn write(
        &mut self,
        artifact: &str,
        path: &str,
        data: &[u8],
    ) -> std::io::Result<bool> {
        if !is_safe_artifact_path(artifact) || !is_safe_artifact_path(path) {
            tracing::debug!("Skipping unsafe artifact path {:?}/{:?}", artifact, path);
            return Ok(false);
        }

        let first_chunk = self.seen.insert((artifact.to_string(), path.to_string()));
        let Some(root) = &self.root else {
            self.bytes_written += data.len() as u64;
            return Ok(true);
        };

        let destination = root.join(artifact).join(path);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = if first_chunk {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&destination)
                .await?
        } else {
            OpenOptions::new().append(true).open(&destination).await?
        };
        file.write_all(data).await?;
        file.flush().await?;

        self.bytes_written += data.len() as u64;
        Ok(true)
    }
}
