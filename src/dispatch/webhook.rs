use reqwest::{Client, Url};
use std::time::Duration;

use super::{classify_status, classify_transport_error};
use crate::errors::DeliveryError;
use crate::models::{Endpoint, Event, HttpMethod, WebhookBody};
use crate::utils::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

pub const TOKEN_HEADER: &str = "X-Notification-Token";

// ============================================================================
// Webhook Client
// ============================================================================
//
// One attempt = one HTTP call. Retrying is the dispatcher's job; this client
// only classifies what happened. Each target URL has its own circuit breaker
// so one dead receiver cannot eat the retry budget of every event.
//
// ============================================================================

pub struct WebhookClient {
    client: Client,
    /// Used only for endpoints that opted out of certificate checks
    insecure_client: Client,
    breakers: CircuitBreakerRegistry,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Self::with_breaker_config(timeout, CircuitBreakerConfig::default())
    }

    pub fn with_breaker_config(
        timeout: Duration,
        breaker_config: CircuitBreakerConfig,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        let insecure_client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            insecure_client,
            breakers: CircuitBreakerRegistry::new(breaker_config),
        })
    }

    pub async fn send(&self, endpoint: &Endpoint, event: &Event) -> Result<(), DeliveryError> {
        let url = Url::parse(&endpoint.target)
            .map_err(|e| DeliveryError::Permanent(format!("invalid target URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeliveryError::Permanent(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let breaker = self.breakers.get(&endpoint.target);
        if breaker.try_acquire().is_err() {
            return Err(DeliveryError::CircuitOpen(endpoint.target.clone()));
        }

        let properties = &endpoint.properties;
        let client = if properties.disable_tls_verification {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut request = match properties.method {
            HttpMethod::Post => client.post(url),
            HttpMethod::Put => client.put(url),
        }
        .json(&WebhookBody::from(event));

        if let Some(token) = &properties.secret_token {
            request = request.header(TOKEN_HEADER, token);
        }

        let result = match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) => Err(classify_transport_error(&e)),
        };

        match &result {
            Err(DeliveryError::Transient(_)) => breaker.record_failure(),
            // The receiver answered, even if it said no
            _ => breaker.record_success(),
        }

        result
    }

    /// Targets whose breaker is open or probing.
    pub fn tripped_targets(&self) -> Vec<(String, CircuitState)> {
        self.breakers.tripped()
    }
}
