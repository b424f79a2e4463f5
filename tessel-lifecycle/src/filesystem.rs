//! Directory-backed snapshot repository.
//!
//! A shared mount (NFS or similar) pointed at by every node serves as the
//! cold-tier store in small deployments. Snapshots are files under the base
//! directory named by their key; writes go through a temp file and a rename
//! so readers never observe a half-written snapshot.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::repository::{SnapshotKey, SnapshotRepository};

/// Suffix of in-progress writes, skipped by `list`.
const TEMP_SUFFIX: &str = "tmp";

/// Configuration for [`FilesystemRepository`].
#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    /// Base directory for all snapshots.
    pub base_path: PathBuf,
    /// Whether to fsync after each write.
    pub sync_on_write: bool,
}

impl FilesystemConfig {
    /// Durable configuration rooted at `base_path`.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sync_on_write: true,
        }
    }

    /// Configuration without fsync, for tests.
    #[must_use]
    pub fn for_testing(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sync_on_write: false,
        }
    }
}

/// Snapshot repository on a local or shared directory.
#[derive(Debug, Clone)]
pub struct FilesystemRepository {
    config: FilesystemConfig,
}

impl FilesystemRepository {
    /// Opens the repository, creating the base directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the base directory cannot be created.
    pub async fn open(config: FilesystemConfig) -> LifecycleResult<Self> {
        debug_assert!(!config.base_path.as_os_str().is_empty());
        tokio::fs::create_dir_all(&config.base_path)
            .await
            .map_err(|e| io_error("create_base_dir", &config.base_path, &e))?;
        Ok(Self { config })
    }

    fn path_of(&self, key: &SnapshotKey) -> PathBuf {
        self.config.base_path.join(key.as_str())
    }

    async fn write_atomic(&self, key: &SnapshotKey, data: &[u8]) -> LifecycleResult<()> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create_parent_dirs", parent, &e))?;
        }
        let temp = path.with_extension(TEMP_SUFFIX);
        let upload_failed = |e: std::io::Error| LifecycleError::UploadFailed {
            key: key.to_string(),
            message: e.to_string(),
        };

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await.map_err(upload_failed)?;
            file.write_all(data).await.map_err(upload_failed)?;
            if self.config.sync_on_write {
                file.sync_all().await.map_err(upload_failed)?;
            }
            Ok::<(), LifecycleError>(())
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }

        tokio::fs::rename(&temp, &path).await.map_err(upload_failed)
    }
}

fn io_error(operation: &'static str, path: &std::path::Path, e: &std::io::Error) -> LifecycleError {
    LifecycleError::Io {
        operation,
        message: format!("{}: {e}", path.display()),
    }
}

#[async_trait]
impl SnapshotRepository for FilesystemRepository {
    async fn put(&self, key: &SnapshotKey, data: Bytes) -> LifecycleResult<()> {
        self.write_atomic(key, &data).await?;
        debug!(key = %key, bytes = data.len(), "snapshot stored");
        Ok(())
    }

    async fn get(&self, key: &SnapshotKey) -> LifecycleResult<Bytes> {
        match tokio::fs::read(self.path_of(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LifecycleError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(LifecycleError::DownloadFailed {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &SnapshotKey) -> LifecycleResult<()> {
        let path = self.path_of(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, &e)),
        }
    }

    async fn list(&self, prefix: &str) -> LifecycleResult<Vec<SnapshotKey>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.config.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("list", &dir, &e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("list", &dir, &e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("list", &path, &e))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().is_some_and(|ext| ext == TEMP_SUFFIX) {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.config.base_path) {
                    let key = relative.to_string_lossy();
                    if key.starts_with(prefix) {
                        keys.push(SnapshotKey::new(key.as_ref()));
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tessel_core::{IndexId, ShardId, ShardOrdinal};

    async fn repository() -> (FilesystemRepository, TempDir) {
        let dir = TempDir::new().expect("create temp dir");
        let repo = FilesystemRepository::open(FilesystemConfig::for_testing(dir.path()))
            .await
            .expect("open repository");
        (repo, dir)
    }

    fn key(index: u64, ordinal: u32) -> SnapshotKey {
        SnapshotKey::for_shard(ShardId::new(IndexId::new(index), ShardOrdinal::new(ordinal)))
    }

    #[tokio::test]
    async fn test_put_overwrites_and_get_reads_latest() {
        let (repo, _dir) = repository().await;
        repo.put(&key(1, 0), Bytes::from_static(b"old")).await.unwrap();
        repo.put(&key(1, 0), Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(repo.get(&key(1, 0)).await.unwrap(), Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_not_found() {
        let (repo, _dir) = repository().await;
        assert!(matches!(
            repo.get(&key(9, 9)).await,
            Err(LifecycleError::NotFound { .. })
        ));
        repo.delete(&key(9, 9)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_index_prefix_skips_temp_files() {
        let (repo, dir) = repository().await;
        for (index, ordinal) in [(1, 0), (1, 1), (2, 0)] {
            repo.put(&key(index, ordinal), Bytes::from_static(b"x")).await.unwrap();
        }
        std::fs::write(dir.path().join("index-1/shard-2.tmp"), b"partial").unwrap();

        let listed = repo.list("index-1/").await.unwrap();
        assert_eq!(listed, vec![key(1, 0), key(1, 1)]);
        assert_eq!(repo.list("").await.unwrap().len(), 3);
    }
}
