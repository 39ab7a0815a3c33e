use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::batch::DrainedBatch;
use crate::error::ArchiveError;
use crate::staging::StagingBackend;

/// On-disk staging: drained batches are appended to a single local file,
/// created on first append and deleted only after a successful upload.
/// The file is never truncated between appends.
#[derive(Debug)]
pub struct DiskStaging {
    path: PathBuf,
}

impl DiskStaging {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete a staging file left behind by a previous run. Resuming a
    /// stale artifact is a caller policy, not a backend behavior.
    pub async fn remove_stale(&self) -> Result<bool, ArchiveError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed stale staging file {:?}", self.path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> ArchiveError {
        ArchiveError::StagingIo {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl StagingBackend for DiskStaging {
    async fn stage(&self, batch: &DrainedBatch) -> Result<(), ArchiveError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&batch.bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    async fn materialize(&self) -> Result<Bytes, ArchiveError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            // No appends happened this cycle.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Bytes::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn discard(&self) -> Result<(), ArchiveError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(bytes: &[u8], records: u64) -> DrainedBatch {
        DrainedBatch {
            bytes: bytes.to_vec(),
            records,
        }
    }

    fn staging_in(dir: &tempfile::TempDir) -> DiskStaging {
        DiskStaging::new(dir.path().join("archiver.buffer"))
    }

    #[tokio::test]
    async fn test_stage_appends_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_in(&dir);

        staging.stage(&batch(b"a\nb\n", 2)).await.unwrap();
        let after_first = std::fs::read(staging.path()).unwrap();

        staging.stage(&batch(b"c\n", 1)).await.unwrap();
        let after_second = std::fs::read(staging.path()).unwrap();

        // Prior content is a strict prefix of the grown file.
        assert!(after_second.starts_with(&after_first));
        assert_eq!(after_second, b"a\nb\nc\n");
    }

    #[tokio::test]
    async fn test_materialize_reads_whole_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_in(&dir);

        staging.stage(&batch(b"a\n", 1)).await.unwrap();
        staging.stage(&batch(b"b\n", 1)).await.unwrap();

        assert_eq!(staging.materialize().await.unwrap().as_ref(), b"a\nb\n");
        // Materialize is read-only: the artifact is unchanged afterwards.
        assert_eq!(std::fs::read(staging.path()).unwrap(), b"a\nb\n");
    }

    #[tokio::test]
    async fn test_materialize_before_any_stage_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_in(&dir);
        assert!(staging.materialize().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_in(&dir);

        staging.stage(&batch(b"a\n", 1)).await.unwrap();
        staging.discard().await.unwrap();
        assert!(!staging.path().exists());

        staging.discard().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_stale() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_in(&dir);

        assert!(!staging.remove_stale().await.unwrap());

        std::fs::write(staging.path(), b"left over from a previous run\n").unwrap();
        assert!(staging.remove_stale().await.unwrap());
        assert!(!staging.path().exists());
    }
}
