use crate::consumer::ConsumerState;
use crate::utils::IsTransient;

// ============================================================================
// Error Taxonomy
// ============================================================================
//
// Per-message and per-recipient errors are contained where they happen.
// Only `SourceError` is allowed to stop a consume loop.
//
// ============================================================================

/// A raw message that cannot be turned into an `Event`.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message has no payload")]
    EmptyPayload,

    #[error("Unparsable message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported schema version: {0}")]
    UnsupportedVersion(u32),

    #[error("Missing or empty field: {0}")]
    MissingField(&'static str),
}

impl DecodeError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::EmptyPayload => "empty_payload",
            DecodeError::Malformed(_) => "malformed",
            DecodeError::UnsupportedVersion(_) => "unsupported_version",
            DecodeError::MissingField(_) => "missing_field",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt {entity} record: {reason}")]
    Corrupt { entity: &'static str, reason: String },

    #[error("Endpoint store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to resolve recipients: {0}")]
pub struct ResolutionError(#[from] pub StoreError);

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Timeouts, connection failures, 5xx; worth retrying
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// 4xx, invalid target; retrying cannot help
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    #[error("Circuit open for target {0}")]
    CircuitOpen(String),
}

impl IsTransient for DeliveryError {
    fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Event source closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerLifecycleError {
    #[error("Consumer {consumer} cannot start while {state:?}")]
    AlreadyStarted {
        consumer: &'static str,
        state: ConsumerState,
    },

    #[error("Consumer {consumer} is not running")]
    NotRunning { consumer: &'static str },

    #[error("Consumer {consumer} failed to subscribe: {source}")]
    Subscribe {
        consumer: &'static str,
        #[source]
        source: SourceError,
    },

    #[error("Consumer {consumer} halted: {source}")]
    Halted {
        consumer: &'static str,
        #[source]
        source: SourceError,
    },

    #[error("Consumer {consumer} loop task failed: {reason}")]
    LoopPanicked {
        consumer: &'static str,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
