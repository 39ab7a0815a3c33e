use std::time::Duration;

use envconfig::Envconfig;

use crate::engine::{EnginePolicy, FlushPolicy};
use crate::error::ArchiveError;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StagingStrategy {
    Memory,
    Disk,
}

impl std::str::FromStr for StagingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "memory" => Ok(StagingStrategy::Memory),
            "disk" => Ok(StagingStrategy::Disk),
            _ => Err(format!("Unknown staging strategy: {s}")),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    // Empty picks a random ephemeral group at startup
    #[envconfig(default = "")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "4")]
    pub consumer_loop_count: usize,

    // Staging configuration
    #[envconfig(default = "memory")]
    pub staging_strategy: StagingStrategy,

    // Outer tier: when an archive object is written. 0 disables the
    // count trigger (age-only mode).
    #[envconfig(default = "10000")]
    pub archive_max_messages: u64,

    #[envconfig(default = "300")]
    pub archive_max_age_secs: u64,

    // Inner tier (disk strategy only): when buffered messages are
    // appended to the local staging file.
    #[envconfig(default = "1000")]
    pub staging_max_messages: u64,

    #[envconfig(default = "30")]
    pub staging_max_age_secs: u64,

    #[envconfig(default = "/tmp/kafka-archiver.buffer")]
    pub staging_file_path: String,

    // A staging file left by a previous run is deleted at startup rather
    // than resumed.
    #[envconfig(default = "true")]
    pub staging_remove_stale: bool,

    // Object store configuration
    pub s3_bucket: String,

    #[envconfig(default = "archive")]
    pub s3_key_prefix: String,

    #[envconfig(default = "jsonl")]
    pub s3_file_extension: String,

    #[envconfig(default = "us-east-1")]
    pub s3_region: String,

    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,

    #[envconfig(default = "5242880")] // 5 MiB
    pub upload_chunk_size: usize,

    #[envconfig(default = "300")] // 5 minutes
    pub s3_timeout_secs: u64,

    // Pending flush jobs allowed before message delivery blocks
    #[envconfig(default = "8")]
    pub flush_queue_depth: usize,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.archive_max_age_secs == 0 {
            return Err(ArchiveError::Configuration(
                "ARCHIVE_MAX_AGE_SECS must be nonzero".to_string(),
            ));
        }
        if self.upload_chunk_size == 0 {
            return Err(ArchiveError::Configuration(
                "UPLOAD_CHUNK_SIZE must be nonzero".to_string(),
            ));
        }
        if self.s3_timeout_secs == 0 {
            return Err(ArchiveError::Configuration(
                "S3_TIMEOUT_SECS must be nonzero".to_string(),
            ));
        }
        if self.consumer_loop_count == 0 {
            return Err(ArchiveError::Configuration(
                "CONSUMER_LOOP_COUNT must be nonzero".to_string(),
            ));
        }
        if self.flush_queue_depth == 0 {
            return Err(ArchiveError::Configuration(
                "FLUSH_QUEUE_DEPTH must be nonzero".to_string(),
            ));
        }

        if self.staging_strategy == StagingStrategy::Disk {
            if self.staging_file_path.is_empty() {
                return Err(ArchiveError::Configuration(
                    "STAGING_FILE_PATH is required with the disk strategy".to_string(),
                ));
            }
            if self.staging_max_age_secs == 0 {
                return Err(ArchiveError::Configuration(
                    "STAGING_MAX_AGE_SECS must be nonzero".to_string(),
                ));
            }
            if self.archive_max_messages > 0
                && self.staging_max_messages > self.archive_max_messages
            {
                return Err(ArchiveError::Configuration(format!(
                    "STAGING_MAX_MESSAGES ({}) exceeds ARCHIVE_MAX_MESSAGES ({})",
                    self.staging_max_messages, self.archive_max_messages
                )));
            }
        }
        Ok(())
    }

    /// The configured group, or a random ephemeral one — the archiver can
    /// be pointed at a topic ad hoc without coordinating group names.
    pub fn consumer_group(&self) -> String {
        if self.kafka_consumer_group.is_empty() {
            format!("kafka-archiver-{:06}", rand::random::<u32>() % 1_000_000)
        } else {
            self.kafka_consumer_group.clone()
        }
    }

    pub fn engine_policy(&self) -> EnginePolicy {
        EnginePolicy {
            archive: FlushPolicy {
                max_records: self.archive_max_messages,
                max_age: Duration::from_secs(self.archive_max_age_secs),
            },
            staging: (self.staging_strategy == StagingStrategy::Disk).then(|| FlushPolicy {
                max_records: self.staging_max_messages,
                max_age: Duration::from_secs(self.staging_max_age_secs),
            }),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn s3_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
