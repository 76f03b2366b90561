use crate::consumer::{ShutdownReport, TopicConsumer};
use crate::errors::ConsumerLifecycleError;
use crate::routing::{EmailRouting, WebhookRouting};

// ============================================================================
// Notification Service - composition root
// ============================================================================
//
// Owns both topic consumers. Whether they run at all is decided once, by the
// caller, through `consumers_enabled`; nothing below this point looks at the
// run mode.
//
// ============================================================================

pub struct NotificationService {
    webhooks: TopicConsumer<WebhookRouting>,
    emails: TopicConsumer<EmailRouting>,
    consumers_enabled: bool,
}

/// Per-consumer result of a service shutdown.
pub struct ServiceShutdown {
    pub webhooks: Result<ShutdownReport, ConsumerLifecycleError>,
    pub emails: Result<ShutdownReport, ConsumerLifecycleError>,
}

impl NotificationService {
    pub fn new(
        webhooks: TopicConsumer<WebhookRouting>,
        emails: TopicConsumer<EmailRouting>,
        consumers_enabled: bool,
    ) -> Self {
        Self {
            webhooks,
            emails,
            consumers_enabled,
        }
    }

    pub fn consumers_enabled(&self) -> bool {
        self.consumers_enabled
    }

    /// Start both consumers. One failing to start does not stop the other.
    pub async fn start(&mut self) -> Vec<ConsumerLifecycleError> {
        if !self.consumers_enabled {
            tracing::info!("Consumers disabled, not starting");
            return Vec::new();
        }

        let mut errors = Vec::new();
        if let Err(e) = self.webhooks.start().await {
            tracing::error!(error = %e, "Webhook consumer failed to start");
            errors.push(e);
        }
        if let Err(e) = self.emails.start().await {
            tracing::error!(error = %e, "Email subscription consumer failed to start");
            errors.push(e);
        }
        errors
    }

    /// Shut both consumers down concurrently. `None` when consumers were
    /// never enabled.
    pub async fn shutdown(&mut self) -> Option<ServiceShutdown> {
        if !self.consumers_enabled {
            return None;
        }

        let (webhooks, emails) =
            futures_util::future::join(self.webhooks.shutdown(), self.emails.shutdown()).await;

        for (consumer, result) in [(self.webhooks.name(), &webhooks), (self.emails.name(), &emails)] {
            match result {
                Ok(report) => tracing::info!(
                    consumer = consumer,
                    completed = report.completed,
                    abandoned = report.abandoned,
                    "Consumer shut down"
                ),
                Err(e) => tracing::warn!(consumer = consumer, error = %e, "Consumer shutdown error"),
            }
        }

        Some(ServiceShutdown { webhooks, emails })
    }
}
