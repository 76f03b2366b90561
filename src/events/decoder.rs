use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::DecodeError;
use crate::messaging::RawMessage;
use crate::models::{AccountId, Event};

// ============================================================================
// Event Decoder
// ============================================================================
//
// Wire format (JSON):
//   {
//     "version": 1,                     optional, defaults to 1
//     "account_id": "acc1",             required, non-empty
//     "event_type": "deploy.completed", required, non-empty
//     "application": "deployments",     optional
//     "timestamp": "2024-01-01T00:00:00Z", optional
//     "payload": { ... }                optional, defaults to {}
//   }
//
// ============================================================================

pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct Envelope {
    version: Option<u32>,
    account_id: Option<String>,
    event_type: Option<String>,
    application: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventDecoder;

impl EventDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, message: &RawMessage) -> Result<Event, DecodeError> {
        let bytes = message
            .payload
            .as_deref()
            .filter(|bytes| !bytes.is_empty())
            .ok_or(DecodeError::EmptyPayload)?;

        let envelope: Envelope = serde_json::from_slice(bytes)?;

        let version = envelope.version.unwrap_or(SUPPORTED_SCHEMA_VERSION);
        if version != SUPPORTED_SCHEMA_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let account_id = required(envelope.account_id, "account_id")?;
        let event_type = required(envelope.event_type, "event_type")?;

        Ok(Event {
            account_id: AccountId::new(account_id),
            event_type,
            application: envelope.application.filter(|app| !app.trim().is_empty()),
            payload: envelope
                .payload
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            received_at: envelope
                .timestamp
                .or(message.timestamp)
                .unwrap_or_else(Utc::now),
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DecodeError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(DecodeError::MissingField(field))
}
