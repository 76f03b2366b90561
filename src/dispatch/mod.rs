mod email;
mod webhook;

#[cfg(test)]
pub(crate) use email::recording::RecordingEmailSender;
pub use email::{EmailSender, HttpEmailSender};
pub use webhook::WebhookClient;

use chrono::Utc;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::DeliveryError;
use crate::messaging::{DeadLetter, DeadLetterPublisher};
use crate::metrics::Metrics;
use crate::models::{EmailRequest, Event, Notification, Recipient};
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Notification Dispatcher
// ============================================================================
//
// Delivers one event to many recipients. Each recipient gets its own task,
// its own retry budget and its own terminal outcome; nothing one recipient
// does can fail another. A semaphore caps deliveries running at once across
// every message of the owning consumer.
//
// ============================================================================

/// Terminal state of one recipient's delivery.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
    },
    Failed {
        error: DeliveryError,
        attempts: u32,
        /// True when every allowed attempt failed transiently
        exhausted: bool,
    },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Every recipient of one event reached a terminal state.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.delivered + self.failed
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    consumer: &'static str,
    webhooks: Arc<WebhookClient>,
    email: Arc<dyn EmailSender>,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    dead_letters: Option<Arc<dyn DeadLetterPublisher>>,
}

impl NotificationDispatcher {
    pub fn new(
        consumer: &'static str,
        webhooks: Arc<WebhookClient>,
        email: Arc<dyn EmailSender>,
        retry: RetryConfig,
        max_in_flight: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            consumer,
            webhooks,
            email,
            retry,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            metrics,
            dead_letters: None,
        }
    }

    pub fn with_dead_letters(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = Some(publisher);
        self
    }

    /// Deliver to one recipient, retrying transient failures.
    pub async fn dispatch(&self, event: &Event, recipient: &Recipient) -> DeliveryOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return DeliveryOutcome::Failed {
                    error: DeliveryError::Permanent("dispatcher closed".to_string()),
                    attempts: 0,
                    exhausted: false,
                }
            }
        };
        let _in_flight = InFlightGuard::new(&self.metrics, self.consumer);
        let started = Instant::now();

        let result =
            retry_on_transient(&self.retry, |attempt| self.deliver_once(event, recipient, attempt))
                .await;

        let outcome = match result {
            RetryResult::Success { attempts, .. } => DeliveryOutcome::Delivered { attempts },
            RetryResult::Exhausted { error, attempts } => DeliveryOutcome::Failed {
                error,
                attempts,
                exhausted: true,
            },
            RetryResult::PermanentFailure { error, attempts } => DeliveryOutcome::Failed {
                error,
                attempts,
                exhausted: false,
            },
        };

        if let Recipient::Webhook(_) = recipient {
            self.metrics
                .set_tripped_webhook_targets(self.webhooks.tripped_targets().len());
        }

        let channel = recipient.channel();
        let label = if outcome.is_delivered() { "delivered" } else { "failed" };
        self.metrics.record_delivery(
            self.consumer,
            channel,
            label,
            outcome.attempts(),
            started.elapsed().as_secs_f64(),
        );

        match &outcome {
            DeliveryOutcome::Delivered { attempts } => {
                tracing::debug!(
                    consumer = self.consumer,
                    account_id = %event.account_id,
                    event_type = %event.event_type,
                    recipient = %recipient.describe(),
                    attempts = attempts,
                    "✅ Notification delivered"
                );
            }
            DeliveryOutcome::Failed {
                error,
                attempts,
                exhausted,
            } => {
                tracing::error!(
                    consumer = self.consumer,
                    account_id = %event.account_id,
                    event_type = %event.event_type,
                    recipient = %recipient.describe(),
                    attempts = attempts,
                    exhausted = exhausted,
                    error = %error,
                    "❌ Notification delivery failed"
                );
                self.publish_dead_letter(event, recipient, error, *attempts).await;
            }
        }

        outcome
    }

    /// Fan out to every recipient and wait until each one is terminal.
    pub async fn dispatch_all(&self, event: Arc<Event>, recipients: Vec<Recipient>) -> DispatchReport {
        let mut tasks = JoinSet::new();

        for recipient in recipients {
            let dispatcher = self.clone();
            let notification = Notification {
                event: event.clone(),
                recipient,
            };
            tasks.spawn(async move {
                dispatcher
                    .dispatch(&notification.event, &notification.recipient)
                    .await
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) if outcome.is_delivered() => report.delivered += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    // A panicking delivery is still terminal for its recipient
                    tracing::error!(consumer = self.consumer, error = %e, "Delivery task failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn deliver_once(
        &self,
        event: &Event,
        recipient: &Recipient,
        attempt: u32,
    ) -> Result<(), DeliveryError> {
        tracing::debug!(
            consumer = self.consumer,
            recipient = %recipient.describe(),
            attempt = attempt,
            "Attempting delivery"
        );

        match recipient {
            Recipient::Webhook(endpoint) => self.webhooks.send(endpoint, event).await,
            Recipient::Email(subscription) => {
                let request = EmailRequest {
                    account_id: event.account_id.clone(),
                    user_id: subscription.user_id.clone(),
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                };
                self.email.send(&request).await
            }
        }
    }

    async fn publish_dead_letter(
        &self,
        event: &Event,
        recipient: &Recipient,
        error: &DeliveryError,
        attempts: u32,
    ) {
        let Some(publisher) = &self.dead_letters else {
            return;
        };

        let letter = DeadLetter {
            account_id: event.account_id.clone(),
            event_type: event.event_type.clone(),
            channel: recipient.channel(),
            recipient: recipient.describe(),
            error: error.to_string(),
            attempts,
            payload: event.payload.clone(),
            failed_at: Utc::now(),
        };

        match publisher.publish(&letter).await {
            Ok(()) => self.metrics.record_dead_letter(letter.channel),
            Err(e) => {
                tracing::warn!(
                    consumer = self.consumer,
                    recipient = %letter.recipient,
                    error = %e,
                    "Could not publish dead letter"
                );
            }
        }
    }
}

/// Keeps the in-flight gauge right even when a delivery is aborted.
struct InFlightGuard<'a> {
    metrics: &'a Metrics,
    consumer: &'static str,
}

impl<'a> InFlightGuard<'a> {
    fn new(metrics: &'a Metrics, consumer: &'static str) -> Self {
        metrics.delivery_started(consumer);
        Self { metrics, consumer }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.delivery_finished(self.consumer);
    }
}

// ============================================================================
// Response classification (shared by webhook and email transports)
// ============================================================================

pub(crate) fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("HTTP {}", status);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(DeliveryError::Transient(message))
    } else {
        Err(DeliveryError::Permanent(message))
    }
}

pub(crate) fn classify_transport_error(error: &reqwest::Error) -> DeliveryError {
    if error.is_builder() {
        DeliveryError::Permanent(error.to_string())
    } else {
        // Timeouts, refused connections, resets
        DeliveryError::Transient(error.to_string())
    }
}
