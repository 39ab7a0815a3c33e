//! Where drained batches live between the buffer and the object store.
//!
//! Two interchangeable strategies selected at startup: `MemoryStaging`
//! keeps the artifact in process memory (nothing survives a crash between
//! drain and upload); `DiskStaging` appends to a single local file so the
//! upload cadence can be much coarser than the in-memory footprint.

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::DrainedBatch;
use crate::error::ArchiveError;

mod disk;
mod memory;

pub use disk::DiskStaging;
pub use memory::MemoryStaging;

#[async_trait]
pub trait StagingBackend: Send + Sync {
    /// Append a drained batch to the current artifact.
    async fn stage(&self, batch: &DrainedBatch) -> Result<(), ArchiveError>;

    /// Read back the full artifact for upload.
    async fn materialize(&self) -> Result<Bytes, ArchiveError>;

    /// Drop the artifact. Only called after the upload succeeded.
    async fn discard(&self) -> Result<(), ArchiveError>;
}
