//! The accumulation engine: deduplication, batching, and the two-tier
//! flush pipeline.
//!
//! "Fingerprint check-and-insert, payload append, threshold evaluation"
//! is one critical section under a single mutex, so concurrent deliveries
//! can never double-accept a payload or double-trigger a flush of the same
//! data. All staging and upload I/O happens in one background flusher task
//! operating on owned drained batches, fed through a bounded command
//! channel: when the flusher falls behind (a store outage, say), the
//! channel fills and delivery blocks, which stops the consumer loops from
//! pulling and acking more messages. Back-pressure instead of data loss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::batch::{BatchBuffer, DrainedBatch};
use crate::dedup::{DedupOutcome, Deduplicator};
use crate::error::ArchiveError;
use crate::metrics_consts::{
    ARCHIVES_WRITTEN, ARCHIVE_BYTES, ARCHIVE_RECORDS, BATCHES_STAGED, FLUSH_RETRIES,
    MESSAGES_ACCEPTED, MESSAGES_DEDUPLICATED, STAGED_BYTES,
};
use crate::staging::StagingBackend;
use crate::uploader::ArchiveUploader;

const MAX_FLUSH_BACKOFF: Duration = Duration::from_secs(30);

/// How many fresh upload cycles an auth failure is given before it stops
/// the pipeline. Credential refresh happens inside the SDK between cycles.
const AUTH_RETRY_CYCLES: u32 = 3;

/// Flush thresholds for one tier. `max_records == 0` disables the count
/// trigger for that tier.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub max_records: u64,
    pub max_age: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnginePolicy {
    /// Outer tier: when an archive object is written.
    pub archive: FlushPolicy,
    /// Inner tier: when the in-memory buffer is appended to the staging
    /// artifact. `None` stages only at archive time (memory strategy).
    pub staging: Option<FlushPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Accepted,
    Duplicate,
}

struct Accumulator {
    dedup: Deduplicator,
    buffer: BatchBuffer,
    /// Records already appended to the staging artifact this cycle.
    staged_records: u64,
    last_archive: Instant,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            dedup: Deduplicator::new(),
            buffer: BatchBuffer::new(),
            staged_records: 0,
            last_archive: Instant::now(),
        }
    }

    fn cycle_records(&self) -> u64 {
        self.staged_records + self.buffer.records()
    }
}

enum FlushCommand {
    /// Inner-tier flush: append a drained batch to the staging artifact.
    Stage(DrainedBatch),
    /// Outer-tier flush: stage the buffer tail, then archive everything
    /// staged this cycle.
    Archive {
        tail: Option<DrainedBatch>,
        records: u64,
    },
    Shutdown,
}

pub struct ArchiveEngine {
    accumulator: Mutex<Accumulator>,
    commands: mpsc::Sender<FlushCommand>,
    policy: EnginePolicy,
}

impl ArchiveEngine {
    /// Builds the engine and spawns its flusher task. The returned handle
    /// resolves when the flusher stops: after `finalize`, or with an error
    /// if the store rejects credentials beyond the retry budget.
    pub fn new(
        policy: EnginePolicy,
        staging: Arc<dyn StagingBackend>,
        uploader: ArchiveUploader,
        queue_depth: usize,
    ) -> (Arc<Self>, JoinHandle<Result<(), ArchiveError>>) {
        let (commands, rx) = mpsc::channel(queue_depth);
        let engine = Arc::new(Self {
            accumulator: Mutex::new(Accumulator::new()),
            commands,
            policy,
        });
        let flusher = tokio::spawn(run_flusher(rx, staging, uploader));
        (engine, flusher)
    }

    /// Deduplicate, buffer, and evaluate flush triggers for one delivered
    /// payload. Returns once the payload is owned by the engine; the
    /// caller acks immediately after, whatever the outcome.
    pub async fn handle_message(&self, payload: &[u8]) -> Result<MessageOutcome, ArchiveError> {
        let (outcome, command) = {
            let mut acc = self.accumulator.lock().await;
            if acc.dedup.observe(payload) == DedupOutcome::Duplicate {
                counter!(MESSAGES_DEDUPLICATED).increment(1);
                (MessageOutcome::Duplicate, None)
            } else {
                acc.buffer.accept(payload);
                counter!(MESSAGES_ACCEPTED).increment(1);
                let command = self.evaluate_triggers(&mut acc, Instant::now());
                (MessageOutcome::Accepted, command)
            }
        };

        if let Some(command) = command {
            // Blocks when the flusher is behind; that is the back-pressure
            // boundary for the whole service.
            self.commands
                .send(command)
                .await
                .map_err(|_| ArchiveError::FlushPipelineStopped)?;
        }
        Ok(outcome)
    }

    /// Drain whatever is buffered, archive it, and stop the flusher.
    /// Called once at shutdown.
    pub async fn finalize(&self) -> Result<(), ArchiveError> {
        let command = {
            let mut acc = self.accumulator.lock().await;
            let records = acc.cycle_records();
            if records == 0 {
                None
            } else {
                let now = Instant::now();
                let tail = (!acc.buffer.is_empty()).then(|| acc.buffer.drain(now));
                acc.dedup.reset();
                acc.staged_records = 0;
                acc.last_archive = now;
                Some(FlushCommand::Archive { tail, records })
            }
        };

        if let Some(command) = command {
            self.commands
                .send(command)
                .await
                .map_err(|_| ArchiveError::FlushPipelineStopped)?;
        }
        self.commands
            .send(FlushCommand::Shutdown)
            .await
            .map_err(|_| ArchiveError::FlushPipelineStopped)
    }

    /// Runs under the accumulator lock. Outer tier wins when both fire:
    /// archiving drains the buffer tail anyway.
    fn evaluate_triggers(&self, acc: &mut Accumulator, now: Instant) -> Option<FlushCommand> {
        let records = acc.cycle_records();
        let archive = &self.policy.archive;
        let by_count = archive.max_records > 0 && records >= archive.max_records;
        let by_age = records > 0 && now.duration_since(acc.last_archive) >= archive.max_age;

        if by_count || by_age {
            let tail = (!acc.buffer.is_empty()).then(|| acc.buffer.drain(now));
            // A fresh window per archive cycle: duplicates spanning this
            // boundary are treated as distinct messages.
            acc.dedup.reset();
            acc.staged_records = 0;
            acc.last_archive = now;
            return Some(FlushCommand::Archive { tail, records });
        }

        if let Some(staging) = &self.policy.staging {
            if acc.buffer.should_flush_by_count(staging.max_records)
                || acc.buffer.should_flush_by_age(staging.max_age, now)
            {
                let batch = acc.buffer.drain(now);
                acc.staged_records += batch.records;
                return Some(FlushCommand::Stage(batch));
            }
        }
        None
    }
}

async fn run_flusher(
    mut rx: mpsc::Receiver<FlushCommand>,
    staging: Arc<dyn StagingBackend>,
    uploader: ArchiveUploader,
) -> Result<(), ArchiveError> {
    while let Some(command) = rx.recv().await {
        match command {
            FlushCommand::Stage(batch) => {
                stage_with_retry(staging.as_ref(), &batch).await;
            }
            FlushCommand::Archive { tail, records } => {
                run_archive(staging.as_ref(), &uploader, tail, records).await?;
            }
            FlushCommand::Shutdown => break,
        }
    }
    info!("Flush pipeline stopped");
    Ok(())
}

/// Staging failures are always retryable: keep the batch and keep trying.
async fn stage_with_retry(staging: &dyn StagingBackend, batch: &DrainedBatch) {
    let mut attempt = 0;
    loop {
        match staging.stage(batch).await {
            Ok(()) => {
                counter!(BATCHES_STAGED).increment(1);
                counter!(STAGED_BYTES).increment(batch.bytes.len() as u64);
                return;
            }
            Err(e) => {
                attempt += 1;
                counter!(FLUSH_RETRIES).increment(1);
                warn!(attempt, "Staging append failed, retrying: {e}");
                sleep(flush_backoff(attempt)).await;
            }
        }
    }
}

/// One archive cycle: stage the tail, materialize the artifact, upload it,
/// and only then discard. Transport failures retry forever with capped
/// backoff — the artifact is never dropped. Auth failures get a bounded
/// number of cycles before they stop the pipeline.
async fn run_archive(
    staging: &dyn StagingBackend,
    uploader: &ArchiveUploader,
    tail: Option<DrainedBatch>,
    records: u64,
) -> Result<(), ArchiveError> {
    if let Some(tail) = tail {
        stage_with_retry(staging, &tail).await;
    }

    let mut auth_failures = 0;
    let mut attempt = 0;
    loop {
        match try_archive(staging, uploader, records).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                counter!(FLUSH_RETRIES).increment(1);
                warn!(attempt, records, "Archive flush failed, retrying: {e}");
                sleep(flush_backoff(attempt)).await;
            }
            Err(e @ ArchiveError::UploadAuth(_)) => {
                auth_failures += 1;
                if auth_failures >= AUTH_RETRY_CYCLES {
                    return Err(e);
                }
                attempt += 1;
                counter!(FLUSH_RETRIES).increment(1);
                warn!(
                    auth_failures,
                    "Store rejected credentials, allowing a refresh: {e}"
                );
                sleep(flush_backoff(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A single archive attempt. On any error the staging artifact is left
/// exactly as it was; discard happens only after the upload succeeded.
async fn try_archive(
    staging: &dyn StagingBackend,
    uploader: &ArchiveUploader,
    records: u64,
) -> Result<(), ArchiveError> {
    let bytes = staging.materialize().await?;
    if bytes.is_empty() {
        warn!("Archive cycle with an empty artifact, nothing to upload");
        return Ok(());
    }

    let byte_count = bytes.len();
    let key = uploader.upload(bytes, Utc::now()).await?;
    staging.discard().await?;

    counter!(ARCHIVES_WRITTEN).increment(1);
    counter!(ARCHIVE_RECORDS).increment(records);
    counter!(ARCHIVE_BYTES).increment(byte_count as u64);
    info!(key, records, bytes = byte_count, "Archived batch");
    Ok(())
}

fn flush_backoff(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1 << attempt.min(6));
    Duration::from_millis(millis).min(MAX_FLUSH_BACKOFF)
}
