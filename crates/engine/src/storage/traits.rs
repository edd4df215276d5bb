use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CacheBlob {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl CacheBlob {
    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path).await?)
    }

    pub async fn open(&self) -> Result<fs::File> {
        Ok(fs::File::open(&self.path).await?)
    }

    pub fn creation_time(&self) -> i64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Content cache shared by all tasks of a build.
#[async_trait]
pub trait BlobCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheBlob>>;

    async fn put(&self, key: &str) -> Result<BlobWriter>;

    /// Most recently modified blob whose key starts with `prefix`.
    async fn find_by_prefix(&self, prefix: &str) -> Result<Option<CacheBlob>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

pub type DynBlobCache = Arc<dyn BlobCache>;

/// Write handle returned by [`BlobCache::put`].
///
/// Data lands in a temporary file next to the final entry and only becomes
/// visible to readers once [`BlobWriter::finalize`] renames it into place.
/// Dropping an unfinalized writer discards the partial file.
pub struct BlobWriter {
    key: String,
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl BlobWriter {
    pub(crate) async fn create(key: &str, temp_path: PathBuf, final_path: PathBuf) -> Result<Self> {
        let file = fs::File::create(&temp_path).await?;
        Ok(Self {
            key: key.to_string(),
            file: Some(file),
            temp_path,
            final_path,
            written: 0,
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
            self.written += data.len() as u64;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn finalize(mut self) -> Result<CacheBlob> {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all().await {
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(e.into());
            }
        }
        if let Err(e) = fs::rename(&self.temp_path, &self.final_path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(e.into());
        }

        let metadata = fs::metadata(&self.final_path).await?;
        Ok(CacheBlob {
            key: self.key.clone(),
            path: self.final_path.clone(),
            size_bytes: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
