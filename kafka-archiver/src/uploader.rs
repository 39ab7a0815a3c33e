use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Datelike, Timelike, Utc};
use metrics::{counter, histogram};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ArchiveError;
use crate::metrics_consts::{
    MULTIPART_UPLOADS, UPLOAD_ATTEMPT_FAILURES, UPLOAD_DURATION_SECONDS,
};
use crate::s3_client::ObjectStore;

const CONTENT_TYPE: &str = "text/plain";
const UPLOAD_ATTEMPTS: u32 = 3;

/// Writes one archive object per completed batch, keyed by flush time.
/// Payloads above the chunk size go up through a multipart session so a
/// large staging file never has to fit in a single request.
pub struct ArchiveUploader {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    file_extension: String,
    chunk_size: usize,
}

impl ArchiveUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        key_prefix: String,
        file_extension: String,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            key_prefix,
            file_extension,
            chunk_size,
        }
    }

    /// Key derived from the flush wall-clock time. The millisecond suffix
    /// keeps two flushes landing in the same minute from overwriting each
    /// other.
    pub fn object_key(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{:02}/{:02}/{:02}/{:02}-{}.{}",
            self.key_prefix,
            at.year(),
            at.month(),
            at.day(),
            at.hour(),
            at.minute(),
            at.timestamp_millis(),
            self.file_extension
        )
    }

    /// Upload one completed batch. Transport failures are retried a few
    /// times with linear backoff; auth failures are returned immediately.
    /// The caller keeps the staging artifact until this returns Ok.
    pub async fn upload(
        &self,
        bytes: Bytes,
        key_time: DateTime<Utc>,
    ) -> Result<String, ArchiveError> {
        let key = self.object_key(key_time);
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = if bytes.len() > self.chunk_size {
                self.upload_multipart(&key, &bytes).await
            } else {
                self.store
                    .put_object(&key, bytes.clone(), CONTENT_TYPE)
                    .await
            };

            match result {
                Ok(()) => {
                    histogram!(UPLOAD_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
                    debug!(key, bytes = bytes.len(), "Uploaded archive object");
                    return Ok(key);
                }
                Err(e) if e.is_retryable() && attempt < UPLOAD_ATTEMPTS => {
                    counter!(UPLOAD_ATTEMPT_FAILURES).increment(1);
                    warn!(key, attempt, "Upload attempt failed: {e}");
                    sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => {
                    counter!(UPLOAD_ATTEMPT_FAILURES).increment(1);
                    return Err(e);
                }
            }
        }
    }

    /// Stream the payload in fixed-size chunks as parts of one session.
    /// Any part failure aborts the whole session; a partial object is
    /// never completed.
    async fn upload_multipart(&self, key: &str, bytes: &Bytes) -> Result<(), ArchiveError> {
        let upload_id = self.store.create_multipart_upload(key, CONTENT_TYPE).await?;
        counter!(MULTIPART_UPLOADS).increment(1);

        let mut parts = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let end = usize::min(offset + self.chunk_size, bytes.len());
            let part_number = parts.len() as i32 + 1;

            match self
                .store
                .upload_part(key, &upload_id, part_number, bytes.slice(offset..end))
                .await
            {
                Ok(etag) => parts.push((part_number, etag)),
                Err(e) => {
                    self.abort_session(key, &upload_id).await;
                    return Err(e);
                }
            }
            offset = end;
        }

        if let Err(e) = self
            .store
            .complete_multipart_upload(key, &upload_id, parts)
            .await
        {
            self.abort_session(key, &upload_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn abort_session(&self, key: &str, upload_id: &str) {
        if let Err(e) = self.store.abort_multipart_upload(key, upload_id).await {
            warn!(key, upload_id, "Failed to abort multipart session: {e}");
        }
    }
}
