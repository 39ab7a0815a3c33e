use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::batch::DrainedBatch;
use crate::error::ArchiveError;
use crate::staging::StagingBackend;

/// In-memory staging: the drained batch bytes are the artifact.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    buf: Mutex<Vec<u8>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingBackend for MemoryStaging {
    async fn stage(&self, batch: &DrainedBatch) -> Result<(), ArchiveError> {
        self.buf.lock().await.extend_from_slice(&batch.bytes);
        Ok(())
    }

    async fn materialize(&self) -> Result<Bytes, ArchiveError> {
        Ok(Bytes::copy_from_slice(&self.buf.lock().await))
    }

    async fn discard(&self) -> Result<(), ArchiveError> {
        self.buf.lock().await.clear();
        Ok(())
    }
}
