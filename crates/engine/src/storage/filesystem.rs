use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::traits::{BlobCache, BlobWriter, CacheBlob};
use crate::error::Result;
use crate::util::{is_safe_key, sanitize_key};

const PARTIAL_PREFIX: &str = ".partial-";

pub struct FileSystemBlobCache {
    root_dir: PathBuf,
}

impl FileSystemBlobCache {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    /// Cache rooted at `<root_dir>/<namespace>`, so that builds of different
    /// projects do not see each other's entries.
    pub fn namespaced(root_dir: &Path, namespace: &str) -> Self {
        Self::new(root_dir.join(sanitize_key(namespace)))
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root_dir).await?;
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(sanitize_key(key))
    }

    async fn blob_at(&self, key: &str, path: PathBuf) -> Result<Option<CacheBlob>> {
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(CacheBlob {
                key: key.to_string(),
                size_bytes: metadata.len(),
                modified: metadata.modified()?,
                path,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobCache for FileSystemBlobCache {
    async fn get(&self, key: &str) -> Result<Option<CacheBlob>> {
        let path = self.entry_path(key);
        self.blob_at(key, path).await
    }

    async fn put(&self, key: &str) -> Result<BlobWriter> {
        fs::create_dir_all(&self.root_dir).await?;

        let final_path = self.entry_path(key);
        let temp_path = self
            .root_dir
            .join(format!("{}{}", PARTIAL_PREFIX, uuid::Uuid::new_v4().simple()));

        tracing::debug!("Writing cache entry {} to {:?}", key, final_path);
        BlobWriter::create(key, temp_path, final_path).await
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Option<CacheBlob>> {
        // Hashed entries no longer carry their original key, so only safe
        // prefixes can be matched against entry names.
        if !is_safe_key(prefix) {
            return Ok(None);
        }

        let mut entries = match fs::read_dir(&self.root_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<CacheBlob> = None;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }

            let Some(blob) = self.blob_at(&name, entry.path()).await? else {
                continue;
            };

            let is_newer = newest
                .as_ref()
                .map(|current| blob.modified > current.modified)
                .unwrap_or(true);
            if is_newer {
                newest = Some(blob);
            }
        }

        Ok(newest)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
