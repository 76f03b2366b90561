use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Notification Domain Models
// ============================================================================
//
// Everything here is read-only from the point of view of the consumers:
// accounts are owned by the identity system, endpoints and subscriptions by
// the endpoint store, and events are immutable once decoded.
//
// ============================================================================

/// Opaque account identifier scoping every other entity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A decoded, account-scoped platform event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub account_id: AccountId,
    pub event_type: String,
    /// Originating application, when the producer supplied one
    pub application: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

// ============================================================================
// Endpoints
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Webhook,
    Email,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Webhook => "webhook",
            EndpointType::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "webhook" => Some(EndpointType::Webhook),
            "email" => Some(EndpointType::Email),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

/// Delivery settings specific to webhook endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct WebhookProperties {
    pub method: HttpMethod,
    /// Sent verbatim as `X-Notification-Token` so receivers can authenticate us
    pub secret_token: Option<String>,
    pub disable_tls_verification: bool,
}

/// A registered notification target for an account.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub id: Uuid,
    pub account_id: AccountId,
    pub endpoint_type: EndpointType,
    pub name: String,
    pub description: Option<String>,
    /// URL for webhooks, address for email endpoints
    pub target: String,
    pub enabled: bool,
    /// When set, only events with exactly this type are delivered
    pub event_type_filter: Option<String>,
    pub properties: WebhookProperties,
}

impl Endpoint {
    /// Whether this endpoint wants the given event type.
    pub fn accepts(&self, event_type: &str) -> bool {
        match &self.event_type_filter {
            Some(filter) => filter == event_type,
            None => true,
        }
    }
}

// ============================================================================
// Email Subscriptions
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionChannel {
    Email,
}

/// A user's opt-in to email notifications for one event type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub account_id: AccountId,
    pub user_id: String,
    pub event_type: String,
    pub channel: SubscriptionChannel,
    pub enabled: bool,
}

// ============================================================================
// Recipients & Notifications
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Recipient {
    Webhook(Endpoint),
    Email(Subscription),
}

impl Recipient {
    pub fn channel(&self) -> &'static str {
        match self {
            Recipient::Webhook(_) => "webhook",
            Recipient::Email(_) => "email",
        }
    }

    pub fn account_id(&self) -> &AccountId {
        match self {
            Recipient::Webhook(endpoint) => &endpoint.account_id,
            Recipient::Email(subscription) => &subscription.account_id,
        }
    }

    /// Stable label for logs and dead letters.
    pub fn describe(&self) -> String {
        match self {
            Recipient::Webhook(endpoint) => format!("endpoint:{}", endpoint.id),
            Recipient::Email(subscription) => format!("user:{}", subscription.user_id),
        }
    }
}

/// Everything that should receive one event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecipientSet {
    pub webhook_targets: Vec<Endpoint>,
    pub email_targets: Vec<Subscription>,
}

impl RecipientSet {
    pub fn is_empty(&self) -> bool {
        self.webhook_targets.is_empty() && self.email_targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.webhook_targets.len() + self.email_targets.len()
    }

    pub fn into_recipients(self) -> Vec<Recipient> {
        self.webhook_targets
            .into_iter()
            .map(Recipient::Webhook)
            .chain(self.email_targets.into_iter().map(Recipient::Email))
            .collect()
    }
}

/// One event paired with one recipient, built per dispatch.
#[derive(Clone, Debug)]
pub struct Notification {
    pub event: std::sync::Arc<Event>,
    pub recipient: Recipient,
}

/// Body of the outbound webhook call.
#[derive(Serialize, Debug)]
pub struct WebhookBody<'a> {
    pub account_id: &'a AccountId,
    pub event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
    pub payload: &'a serde_json::Value,
}

impl<'a> From<&'a Event> for WebhookBody<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            account_id: &event.account_id,
            event_type: &event.event_type,
            application: event.application.as_deref(),
            timestamp: event.received_at,
            payload: &event.payload,
        }
    }
}

/// Request handed to the external email service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EmailRequest {
    pub account_id: AccountId,
    pub user_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}
