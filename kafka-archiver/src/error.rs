use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("staging i/o failure on {path}: {source}")]
    StagingIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("object store authentication failure: {0}")]
    UploadAuth(String),

    #[error("object store transport failure: {0}")]
    UploadTransport(String),

    #[error("flush pipeline stopped")]
    FlushPipelineStopped,
}

impl ArchiveError {
    /// Retryable errors keep their drained batch; everything else escalates.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArchiveError::StagingIo { .. } | ArchiveError::UploadTransport(_)
        )
    }
}
