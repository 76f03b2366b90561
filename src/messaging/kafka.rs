use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;

use super::source::{EventSource, EventSourceFactory, MessagePosition, RawMessage};
use crate::errors::SourceError;

// ============================================================================
// Kafka / Redpanda Event Source
// ============================================================================
//
// Offsets are never auto-stored. The consumer loop stores an offset only
// once every recipient of that message reached a terminal state; librdkafka
// then commits stored offsets in the background and once more on close.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    pub brokers: String,
    pub group_id: String,
    pub session_timeout_ms: u32,
    pub auto_commit_interval_ms: u32,
}

impl KafkaSourceConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            session_timeout_ms: 10_000,
            auto_commit_interval_ms: 1_000,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.commit.interval.ms", self.auto_commit_interval_ms.to_string())
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string());
        config
    }
}

/// Creates one rdkafka consumer per subscription.
pub struct KafkaSourceFactory {
    config: KafkaSourceConfig,
}

impl KafkaSourceFactory {
    pub fn new(config: KafkaSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EventSourceFactory for KafkaSourceFactory {
    async fn subscribe(&self, topic: &str) -> Result<Arc<dyn EventSource>, SourceError> {
        let consumer: StreamConsumer = self.config.client_config().create()?;
        consumer.subscribe(&[topic])?;

        tracing::info!(
            topic = %topic,
            group_id = %self.config.group_id,
            brokers = %self.config.brokers,
            "Subscribed to Kafka topic"
        );

        Ok(Arc::new(KafkaEventSource { consumer }))
    }
}

pub struct KafkaEventSource {
    consumer: StreamConsumer,
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn next_message(&self) -> Result<RawMessage, SourceError> {
        let message = self.consumer.recv().await?;

        Ok(RawMessage {
            position: MessagePosition {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }

    fn commit(&self, position: &MessagePosition) -> Result<(), SourceError> {
        // Kafka offsets name the next record to read
        self.consumer
            .store_offset(&position.topic, position.partition, position.offset + 1)?;

        tracing::debug!(position = %position, "Stored consumer offset");
        Ok(())
    }
}
