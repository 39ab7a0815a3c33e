//! Thin consumer over the upstream topic. Delivers one payload plus an
//! acknowledgment handle at a time; the handle stores the partition offset
//! exactly once, and un-acked messages are redelivered by the broker after
//! its timeout (at-least-once upstream semantics).

use std::sync::{Arc, Weak};

use bytes::Bytes;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};

use crate::config::Config;

#[derive(Clone)]
pub struct TopicSource {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Received empty payload")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum AckErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

impl TopicSource {
    pub fn new(config: &Config, consumer_group: &str) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset);

        // Offsets are stored explicitly, one ack per delivered message.
        client_config.set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: config.kafka_consumer_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn recv(&self) -> Result<(Bytes, AckHandle), RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let ack = AckHandle {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            // We auto-ack poison pills, panicking on failure
            ack.ack().expect("Failed to store offset");
            return Err(RecvErr::Empty);
        };

        Ok((Bytes::copy_from_slice(payload), ack))
    }
}

/// Acknowledgment handle for one delivered message. Consuming `self`
/// makes a double ack unrepresentable.
pub struct AckHandle {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl AckHandle {
    pub fn ack(self) -> Result<(), AckErr> {
        let inner = self.handle.upgrade().ok_or(AckErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}
