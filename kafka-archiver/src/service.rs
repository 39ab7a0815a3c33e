use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::{Config, StagingStrategy};
use crate::engine::ArchiveEngine;
use crate::error::ArchiveError;
use crate::metrics_consts::{ACK_FAILURES, EMPTY_PAYLOADS, MESSAGES_RECEIVED};
use crate::s3_client::{S3ObjectStore, S3StoreConfig};
use crate::source::{RecvErr, TopicSource};
use crate::staging::{DiskStaging, MemoryStaging, StagingBackend};
use crate::uploader::ArchiveUploader;

/// The assembled archiver: engine plus flusher, consumer loops, and the
/// startup validation that makes credential and threshold problems fatal
/// before the first message is pulled.
pub struct ArchiverService {
    config: Config,
    engine: Arc<ArchiveEngine>,
    flusher: JoinHandle<Result<(), ArchiveError>>,
    source: TopicSource,
}

impl ArchiverService {
    pub async fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .context("Configuration validation failed")?;

        let store = S3ObjectStore::new(S3StoreConfig {
            bucket: config.s3_bucket.clone(),
            region: config.s3_region.clone(),
            endpoint: config.s3_endpoint.clone(),
            access_key_id: config.s3_access_key_id.clone(),
            secret_access_key: config.s3_secret_access_key.clone(),
            operation_timeout: config.s3_timeout(),
        })
        .await;
        store.check_bucket().await.with_context(|| {
            format!(
                "S3 bucket validation failed for '{}' in region '{}'. Check credentials and bucket access.",
                config.s3_bucket, config.s3_region
            )
        })?;

        let staging: Arc<dyn StagingBackend> = match config.staging_strategy {
            StagingStrategy::Memory => Arc::new(MemoryStaging::new()),
            StagingStrategy::Disk => {
                let staging = DiskStaging::new(config.staging_file_path.clone());
                if config.staging_remove_stale && staging.remove_stale().await? {
                    warn!(
                        "Discarded stale staging file {:?} from a previous run",
                        config.staging_file_path
                    );
                }
                Arc::new(staging)
            }
        };

        let uploader = ArchiveUploader::new(
            Arc::new(store),
            config.s3_key_prefix.clone(),
            config.s3_file_extension.clone(),
            config.upload_chunk_size,
        );

        let (engine, flusher) = ArchiveEngine::new(
            config.engine_policy(),
            staging,
            uploader,
            config.flush_queue_depth,
        );

        let consumer_group = config.consumer_group();
        let source = TopicSource::new(&config, &consumer_group).with_context(|| {
            format!(
                "Failed to create consumer for topic '{}' with group '{}'",
                config.kafka_consumer_topic, consumer_group
            )
        })?;

        info!(
            topic = config.kafka_consumer_topic,
            group = consumer_group,
            strategy = ?config.staging_strategy,
            "Initialized archiver"
        );

        Ok(Self {
            config,
            engine,
            flusher,
            source,
        })
    }

    /// Run until SIGINT, then flush what is buffered and stop.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl+c signal");
        })
        .await
    }

    pub async fn run_with_shutdown(self, signal: impl Future<Output = ()>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut loops = Vec::with_capacity(self.config.consumer_loop_count);
        for _ in 0..self.config.consumer_loop_count {
            loops.push(tokio::spawn(consumer_loop(
                self.source.clone(),
                self.engine.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(
            loops = self.config.consumer_loop_count,
            "Archiver running"
        );

        let mut flusher = self.flusher;
        tokio::select! {
            _ = signal => {
                info!("Received shutdown signal, shutting down gracefully...");
            }
            result = &mut flusher => {
                // The pipeline only stops on its own when the store is
                // rejecting credentials beyond the retry budget.
                let _ = shutdown_tx.send(true);
                for handle in loops {
                    if let Err(e) = handle.await {
                        error!("Delivery loop panicked: {e:#}");
                    }
                }
                return match result {
                    Ok(Ok(())) => Err(anyhow::anyhow!("flush pipeline stopped unexpectedly")),
                    Ok(Err(e)) => Err(e).context("flush pipeline failed"),
                    Err(e) => Err(e).context("flush pipeline panicked"),
                };
            }
        }

        let _ = shutdown_tx.send(true);
        let drain_loops = async {
            for handle in loops {
                if let Err(e) = handle.await {
                    error!("Delivery loop panicked: {e:#}");
                }
            }
        };
        // A loop can be stuck in a full flush queue during a store outage;
        // don't let that hold shutdown forever.
        if tokio::time::timeout(self.config.shutdown_timeout(), drain_loops)
            .await
            .is_err()
        {
            error!(
                "Delivery loops did not stop within {:?}",
                self.config.shutdown_timeout()
            );
        }

        // Everything still buffered becomes one final archive object.
        match tokio::time::timeout(self.config.shutdown_timeout(), self.engine.finalize()).await {
            Ok(result) => result.context("Final flush could not be queued")?,
            Err(_) => {
                error!("Final flush could not be queued before the shutdown timeout");
                return Ok(());
            }
        }

        match tokio::time::timeout(self.config.shutdown_timeout(), flusher).await {
            Ok(Ok(Ok(()))) => info!("Flush pipeline stopped normally"),
            Ok(Ok(Err(e))) => return Err(e).context("Final flush failed"),
            Ok(Err(e)) => error!("Flush pipeline panicked: {e:#}"),
            Err(_) => error!(
                "Flush pipeline shutdown timed out after {:?}",
                self.config.shutdown_timeout()
            ),
        }

        info!("Archiver stopped");
        Ok(())
    }
}

/// One delivery loop. Several of these share the engine; the engine's
/// accumulator lock makes concurrent deliveries safe. Every delivered
/// message is acked exactly once, duplicate or not, before the archive
/// it joined is known to have been written.
async fn consumer_loop(
    source: TopicSource,
    engine: Arc<ArchiveEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = source.recv() => match received {
                Ok((payload, ack)) => {
                    counter!(MESSAGES_RECEIVED).increment(1);
                    match engine.handle_message(&payload).await {
                        Ok(_) => {
                            if let Err(e) = ack.ack() {
                                counter!(ACK_FAILURES).increment(1);
                                warn!("Failed to ack message: {e}");
                            }
                        }
                        Err(e) => {
                            // Leave the message un-acked for redelivery.
                            error!("Dropping out of delivery loop: {e}");
                            break;
                        }
                    }
                }
                Err(RecvErr::Empty) => {
                    counter!(EMPTY_PAYLOADS).increment(1);
                }
                Err(RecvErr::Kafka(e)) => {
                    error!("Kafka receive error: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
