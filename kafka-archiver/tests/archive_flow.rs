//! End-to-end flow through the engine: dedup, two-tier staging, and
//! archival against an in-memory object store.

use std::sync::Arc;
use std::time::Duration;

use kafka_archiver::engine::{ArchiveEngine, EnginePolicy, FlushPolicy, MessageOutcome};
use kafka_archiver::s3_client::MemoryObjectStore;
use kafka_archiver::staging::{DiskStaging, MemoryStaging};
use kafka_archiver::uploader::ArchiveUploader;
use tokio::time::sleep;

fn uploader_with(store: Arc<MemoryObjectStore>, chunk_size: usize) -> ArchiveUploader {
    ArchiveUploader::new(store, "archive".to_string(), "jsonl".to_string(), chunk_size)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_inner_age_trigger_stages_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let staging = Arc::new(DiskStaging::new(dir.path().join("buffer")));
    let staging_path = staging.path().to_path_buf();
    let store = Arc::new(MemoryObjectStore::new());

    let (engine, flusher) = ArchiveEngine::new(
        EnginePolicy {
            archive: FlushPolicy {
                max_records: 0,
                max_age: Duration::from_secs(3600),
            },
            staging: Some(FlushPolicy {
                max_records: 0,
                max_age: Duration::from_millis(500),
            }),
        },
        staging,
        uploader_with(store.clone(), 5 * 1024 * 1024),
        8,
    );

    engine.handle_message(b"first").await.unwrap();
    sleep(Duration::from_millis(700)).await;

    // The next accepted message carries the inner flush: both payloads go
    // to the staging file, no archive object yet.
    engine.handle_message(b"second").await.unwrap();
    wait_for(|| std::fs::read(&staging_path).is_ok_and(|c| c == b"first\nsecond\n")).await;
    assert_eq!(store.object_count(), 0);

    engine.finalize().await.unwrap();
    flusher.await.unwrap().unwrap();

    assert_eq!(store.object_count(), 1);
    let key = store.object_keys().remove(0);
    assert_eq!(store.object(&key).unwrap(), b"first\nsecond\n");
    assert!(!staging_path.exists());
}

#[tokio::test]
async fn test_large_archive_goes_through_multipart() {
    let store = Arc::new(MemoryObjectStore::new());
    let (engine, flusher) = ArchiveEngine::new(
        EnginePolicy {
            archive: FlushPolicy {
                max_records: 2,
                max_age: Duration::from_secs(3600),
            },
            staging: None,
        },
        Arc::new(MemoryStaging::new()),
        // 8-byte chunks force the ~24-byte object through a multipart session.
        uploader_with(store.clone(), 8),
        8,
    );

    engine.handle_message(b"payload-one").await.unwrap();
    engine.handle_message(b"payload-two").await.unwrap();

    wait_for(|| store.object_count() == 1).await;
    let key = store.object_keys().remove(0);
    assert_eq!(store.object(&key).unwrap(), b"payload-one\npayload-two\n");
    assert_eq!(store.open_session_count(), 0);

    engine.finalize().await.unwrap();
    flusher.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_accumulation_continues_while_upload_retries() {
    let store = Arc::new(MemoryObjectStore::new());
    let (engine, flusher) = ArchiveEngine::new(
        EnginePolicy {
            archive: FlushPolicy {
                max_records: 2,
                max_age: Duration::from_secs(3600),
            },
            staging: None,
        },
        Arc::new(MemoryStaging::new()),
        uploader_with(store.clone(), 5 * 1024 * 1024),
        8,
    );

    // The whole first in-call retry burst fails; the flusher backs off and
    // retries while new messages keep flowing into the next cycle.
    store.fail_next_writes(3);

    engine.handle_message(b"a").await.unwrap();
    engine.handle_message(b"b").await.unwrap();

    assert_eq!(
        engine.handle_message(b"c").await.unwrap(),
        MessageOutcome::Accepted
    );
    // "a" was archived out of the dedup window when the flush triggered.
    assert_eq!(
        engine.handle_message(b"a").await.unwrap(),
        MessageOutcome::Accepted
    );

    wait_for(|| store.object_count() == 2).await;

    engine.finalize().await.unwrap();
    flusher.await.unwrap().unwrap();

    let keys = store.object_keys();
    let mut contents: Vec<Vec<u8>> = keys.iter().map(|k| store.object(k).unwrap()).collect();
    contents.sort();
    assert_eq!(contents, vec![b"a\nb\n".to_vec(), b"c\na\n".to_vec()]);
}
