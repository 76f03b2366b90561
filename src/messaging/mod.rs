// ============================================================================
// Messaging
// ============================================================================
//
// - source    - the `EventSource` abstraction consumers pull from
// - kafka     - rdkafka-backed event source with manual offset storage
// - redpanda  - producer used to publish dead letters
//
// ============================================================================

mod kafka;
#[cfg(test)]
mod memory;
mod redpanda;
mod source;

pub use kafka::{KafkaSourceConfig, KafkaSourceFactory};
#[cfg(test)]
pub use memory::{MemorySource, MemorySourceFactory};
pub use redpanda::{DeadLetter, DeadLetterPublisher, RedpandaClient};
pub use source::{EventSource, EventSourceFactory, MessagePosition, RawMessage};
