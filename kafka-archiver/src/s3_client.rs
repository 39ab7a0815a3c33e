//! Object store abstraction for the archiver.
//!
//! Trait-based design with a manual in-memory implementation that is always
//! available for testing, plus the real `aws-sdk-s3` client. The trait
//! surface is exactly what the uploader consumes: single put plus the
//! multipart session operations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion};
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::SdkError,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use tracing::info;

use crate::error::ArchiveError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ArchiveError>;

    /// Returns the upload id of the new multipart session.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, ArchiveError>;

    /// Returns the etag identifying the submitted part.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ArchiveError>;

    /// `parts` is (part number, etag) in submission order.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), ArchiveError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str)
        -> Result<(), ArchiveError>;
}

/// Classify SDK failures into the retryable/fatal split the flush pipeline
/// acts on: 401/403 means credentials, everything else is transport.
fn classify_sdk_error<E>(action: &str, err: SdkError<E>) -> ArchiveError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            if status == 401 || status == 403 {
                ArchiveError::UploadAuth(format!("{action} rejected with status {status}: {err}"))
            } else {
                ArchiveError::UploadTransport(format!(
                    "{action} failed with status {status}: {err}"
                ))
            }
        }
        _ => ArchiveError::UploadTransport(format!("{action} failed: {err}")),
    }
}

/// Configuration for creating the real S3 client.
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Upper bound on any single store call; uploads must never block the
    /// flush pipeline indefinitely.
    pub operation_timeout: std::time::Duration,
}

/// Real S3 client implementation.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Uses the default AWS credential chain (IRSA, env vars, instance
    /// profile) unless explicit credentials are provided in the config.
    pub async fn new(config: S3StoreConfig) -> Self {
        let region = Region::new(config.region.clone());

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let timeout_config = TimeoutConfig::builder()
            .operation_timeout(config.operation_timeout)
            .build();

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .region(region)
            .timeout_config(timeout_config)
            .retry_config(RetryConfig::adaptive());

        if let Some(endpoint) = &config.endpoint {
            // custom endpoints (MinIO, localstack) need force_path_style set
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "env");
            builder = builder.credentials_provider(credentials);
        }

        let client = Client::from_conf(builder.build());

        info!(
            bucket = config.bucket,
            endpoint = config.endpoint,
            "S3 client initialized"
        );

        Self {
            client,
            bucket: config.bucket,
        }
    }

    /// Verify the bucket exists and credentials are accepted. Called once
    /// at startup so credential problems surface before consuming begins.
    pub async fn check_bucket(&self) -> Result<(), ArchiveError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify_sdk_error("head_bucket", e))?;
        Ok(())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ArchiveError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_object", e))?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, ArchiveError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", e))?;

        output.upload_id().map(str::to_string).ok_or_else(|| {
            ArchiveError::UploadTransport(format!(
                "create_multipart_upload for {key} returned no upload id"
            ))
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ArchiveError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error("upload_part", e))?;

        output.e_tag().map(str::to_string).ok_or_else(|| {
            ArchiveError::UploadTransport(format!(
                "upload_part {part_number} for {key} returned no etag"
            ))
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), ArchiveError> {
        let completed_parts: Vec<CompletedPart> = parts
            .into_iter()
            .map(|(part_number, etag)| {
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", e))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ArchiveError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error("abort_multipart_upload", e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    objects: HashMap<String, (Vec<u8>, String)>,
    sessions: HashMap<String, MultipartSession>,
    aborted_sessions: Vec<String>,
    failures_remaining: usize,
    next_upload_id: u64,
}

#[derive(Debug)]
struct MultipartSession {
    key: String,
    content_type: String,
    parts: HashMap<i32, Vec<u8>>,
}

/// In-memory object store for testing - always available, no conditional
/// compilation needed. Can be told to fail the next N write operations
/// with a transport error.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` put/part calls with a transport error.
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().unwrap().failures_remaining = n;
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|(bytes, _)| bytes.clone())
    }

    pub fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn aborted_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted_sessions.clone()
    }

    pub fn open_session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    fn try_consume_failure(state: &mut MemoryStoreState, action: &str) -> Result<(), ArchiveError> {
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(ArchiveError::UploadTransport(format!(
                "injected {action} failure"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ArchiveError> {
        let mut state = self.state.lock().unwrap();
        Self::try_consume_failure(&mut state, "put_object")?;
        state
            .objects
            .insert(key.to_string(), (body.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, ArchiveError> {
        let mut state = self.state.lock().unwrap();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.sessions.insert(
            upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ArchiveError> {
        let mut state = self.state.lock().unwrap();
        Self::try_consume_failure(&mut state, "upload_part")?;
        let session = state.sessions.get_mut(upload_id).ok_or_else(|| {
            ArchiveError::UploadTransport(format!("unknown upload id {upload_id} for {key}"))
        })?;
        session.parts.insert(part_number, body.to_vec());
        Ok(format!("etag-{part_number}"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), ArchiveError> {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.remove(upload_id).ok_or_else(|| {
            ArchiveError::UploadTransport(format!("unknown upload id {upload_id} for {key}"))
        })?;

        let mut assembled = Vec::new();
        for (part_number, _etag) in &parts {
            let part = session.parts.get(part_number).ok_or_else(|| {
                ArchiveError::UploadTransport(format!(
                    "completed with missing part {part_number} for {key}"
                ))
            })?;
            assembled.extend_from_slice(part);
        }

        state
            .objects
            .insert(session.key, (assembled, session.content_type));
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), ArchiveError> {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(upload_id);
        state.aborted_sessions.push(upload_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_put_and_read_back() {
        let store = MemoryObjectStore::new();
        store
            .put_object("archive/a", Bytes::from_static(b"hello\n"), "text/plain")
            .await
            .unwrap();

        assert_eq!(store.object("archive/a").unwrap(), b"hello\n");
        assert_eq!(store.object("archive/missing"), None);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_next_writes(1);

        let err = store
            .put_object("k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UploadTransport(_)));

        store
            .put_object("k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_multipart_assembles_in_order() {
        let store = MemoryObjectStore::new();
        let upload_id = store
            .create_multipart_upload("k", "text/plain")
            .await
            .unwrap();

        let one = store
            .upload_part("k", &upload_id, 1, Bytes::from_static(b"aa"))
            .await
            .unwrap();
        let two = store
            .upload_part("k", &upload_id, 2, Bytes::from_static(b"bb"))
            .await
            .unwrap();

        store
            .complete_multipart_upload("k", &upload_id, vec![(1, one), (2, two)])
            .await
            .unwrap();

        assert_eq!(store.object("k").unwrap(), b"aabb");
        assert_eq!(store.open_session_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_abort_drops_session() {
        let store = MemoryObjectStore::new();
        let upload_id = store
            .create_multipart_upload("k", "text/plain")
            .await
            .unwrap();
        store
            .upload_part("k", &upload_id, 1, Bytes::from_static(b"aa"))
            .await
            .unwrap();

        store.abort_multipart_upload("k", &upload_id).await.unwrap();

        assert_eq!(store.object_count(), 0);
        assert_eq!(store.open_session_count(), 0);
        assert_eq!(store.aborted_sessions(), vec![upload_id]);
    }
}
