//! Kafka topic archiver.
//!
//! Consumes a topic, drops intra-batch duplicate payloads by content
//! fingerprint, accumulates the rest into time- or count-bounded batches,
//! and writes each completed batch as one newline-delimited object in S3,
//! keyed by flush time. Batches are staged either in memory or in a local
//! append-only file (two-tier flushing) before upload; upload failures are
//! retried with back-pressure instead of dropping buffered data.

pub mod batch;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics_consts;
pub mod s3_client;
pub mod service;
pub mod source;
pub mod staging;
pub mod uploader;

pub use engine::{ArchiveEngine, EnginePolicy, FlushPolicy, MessageOutcome};
pub use error::ArchiveError;
