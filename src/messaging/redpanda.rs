use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::{
    config::ClientConfig,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use serde::Serialize;
use std::time::Duration;

use crate::models::AccountId;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

// ============================================================================
// Dead-letter publishing
// ============================================================================
//
// Terminal delivery failures are published to a dead-letter topic so they
// can be inspected or replayed. Publishing is best effort: it never blocks
// message commit.
//
// ============================================================================

/// A recipient that could not be notified.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub account_id: AccountId,
    pub event_type: String,
    pub channel: &'static str,
    pub recipient: String,
    pub error: String,
    pub attempts: u32,
    pub payload: serde_json::Value,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> anyhow::Result<()>;
}

pub struct RedpandaClient {
    producer: FutureProducer,
    topic: String,
    circuit_breaker: CircuitBreaker,
}

impl RedpandaClient {
    pub fn new(brokers: &str, topic: impl Into<String>) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        // Stop hammering the broker once it is clearly down
        let cb_config = CircuitBreakerConfig {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 3,
        };

        Ok(Self {
            producer,
            topic: topic.into(),
            circuit_breaker: CircuitBreaker::new(cb_config),
        })
    }

    pub async fn send(&self, key: &str, payload: &str) -> anyhow::Result<()> {
        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(&self.topic).key(key).payload(payload);

                self.producer
                    .send(record, Timeout::After(Duration::from_secs(5)))
                    .await
                    .map_err(|(e, _)| anyhow::anyhow!("Kafka send error: {}", e))?;

                Ok::<(), anyhow::Error>(())
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %self.topic, key = %key, "Published dead letter");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(
                    topic = %self.topic,
                    "Circuit breaker open - dead-letter topic unavailable"
                );
                Err(anyhow::anyhow!("Circuit breaker open for {}", self.topic))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, topic = %self.topic, "Failed to publish dead letter");
                Err(e)
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }
}

#[async_trait]
impl DeadLetterPublisher for RedpandaClient {
    async fn publish(&self, letter: &DeadLetter) -> anyhow::Result<()> {
        let payload = serde_json::to_string(letter)?;
        // Keyed by account so one account's dead letters stay ordered
        self.send(letter.account_id.as_str(), &payload).await
    }
}
