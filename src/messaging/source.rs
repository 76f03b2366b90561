use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::errors::SourceError;

/// Where a message sits in the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// An undecoded record as pulled from the bus.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub position: MessagePosition,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker/producer timestamp, when the bus provides one
    pub timestamp: Option<DateTime<Utc>>,
}

/// An ordered, partitioned stream of raw messages.
///
/// Delivery is at-least-once: anything not committed before a crash or
/// rebalance comes back.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next message. Must be cancel-safe: dropping the future
    /// before it resolves must not lose a message.
    async fn next_message(&self) -> Result<RawMessage, SourceError>;

    /// Mark `position` and everything before it on the same partition as
    /// processed. Callers commit in offset order per partition.
    fn commit(&self, position: &MessagePosition) -> Result<(), SourceError>;
}

/// Establishes a subscription; called once per consumer start.
#[async_trait]
pub trait EventSourceFactory: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Arc<dyn EventSource>, SourceError>;
}
