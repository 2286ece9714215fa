//! Content-addressed blob filesystem store (spec.md §4.1).
//!
//! Writes are atomic: bytes land in a sibling tmp file first, then are
//! renamed into place, so a reader never observes a partial blob.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Upload,
    Result,
}

impl BlobKind {
    fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Upload => "upload",
            BlobKind::Result => "result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle(pub String);

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Filesystem-backed blob store, rooted at `root_dir`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root_dir: PathBuf,
}

impl BlobStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self { root_dir: root_dir.into() }
    }

    fn path_for(&self, kind: BlobKind, hash: &str, created_at: DateTime<Utc>) -> PathBuf {
        self.root_dir
            .join(kind.as_str())
            .join(created_at.format("%Y").to_string())
            .join(created_at.format("%m").to_string())
            .join(created_at.format("%d").to_string())
            .join(hash)
    }

    fn handle_for(kind: BlobKind, created_at: DateTime<Utc>, hash: &str) -> BlobHandle {
        BlobHandle(format!(
            "{}/{}/{}/{}/{}",
            kind.as_str(),
            created_at.format("%Y"),
            created_at.format("%m"),
            created_at.format("%d"),
            hash
        ))
    }

    fn resolve(&self, handle: &BlobHandle) -> PathBuf {
        self.root_dir.join(&handle.0)
    }

    /// Write `bytes` atomically (tmpfile + rename), returning the handle,
    /// size, and hex-encoded SHA-256 content hash.
    pub async fn put_blob(&self, kind: BlobKind, bytes: &[u8]) -> AppResult<(BlobHandle, u64, String)> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = hex::encode(hasher.finalize());

        let created_at = Utc::now();
        let dest = self.path_for(kind, &hash, created_at);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("creating blob dir: {e}")))?;
        }

        let tmp_path = dest.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("writing tmp blob: {e}")))?;
        tokio::fs::rename(&tmp_path, &dest)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("renaming blob into place: {e}")))?;

        let handle = Self::handle_for(kind, created_at, &hash);
        Ok((handle, bytes.len() as u64, hash))
    }

    pub async fn get_blob(&self, handle: &BlobHandle) -> AppResult<Vec<u8>> {
        let path = self.resolve(handle);
        tokio::fs::read(&path)
            .await
            .map_err(|e| AppError::NotFound(format!("blob {handle}: {e}")))
    }

    pub async fn delete_blob(&self, handle: &BlobHandle) -> AppResult<()> {
        let path = self.resolve(handle);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Internal(anyhow::anyhow!("deleting blob {handle}: {e}"))),
        }
    }

    pub async fn stat_blob(&self, handle: &BlobHandle) -> AppResult<BlobStat> {
        let path = self.resolve(handle);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| AppError::NotFound(format!("blob {handle}: {e}")))?;
        let modified_at = meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        Ok(BlobStat { size_bytes: meta.len(), modified_at })
    }

    /// Remove blobs of `kind` older than `ttl_seconds`, scanning the
    /// date-sharded directory tree. Idempotent: a concurrent GC pass or a
    /// blob already deleted is not an error.
    pub async fn gc_expired(&self, kind: BlobKind, ttl_seconds: i64) -> AppResult<u64> {
        let root = self.root_dir.join(kind.as_str());
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_seconds);
        let mut removed = 0u64;
        removed += walk_and_remove_older_than(&root, cutoff).await?;
        Ok(removed)
    }
}

fn walk_and_remove_older_than<'a>(
    dir: &'a Path,
    cutoff: DateTime<Utc>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = AppResult<u64>> + Send + 'a>> {
    Box::pin(async move {
        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::Internal(anyhow::anyhow!("reading {}: {e}", dir.display()))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("reading dir entry: {e}")))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("stat dir entry: {e}")))?;
            if file_type.is_dir() {
                removed += walk_and_remove_older_than(&path, cutoff).await?;
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("stat file: {e}")))?;
            let modified: DateTime<Utc> = meta
                .modified()
                .ok()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            if modified < cutoff {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let (handle, size, hash) = store.put_blob(BlobKind::Upload, b"hello world").await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(hash.len(), 64);
        let bytes = store.get_blob(&handle).await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let (handle, ..) = store.put_blob(BlobKind::Result, b"data").await.unwrap();
        store.delete_blob(&handle).await.unwrap();
        store.delete_blob(&handle).await.unwrap();
        assert!(store.get_blob(&handle).await.is_err());
    }

    #[tokio::test]
    async fn identical_bytes_map_to_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let (h1, ..) = store.put_blob(BlobKind::Upload, b"same bytes").await.unwrap();
        let (h2, ..) = store.put_blob(BlobKind::Upload, b"same bytes").await.unwrap();
        assert_eq!(h1, h2);
    }
}
