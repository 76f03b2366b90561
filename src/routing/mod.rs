// ============================================================================
// Routing
// ============================================================================
//
// A `RoutingStrategy` is what makes one topic consumer different from the
// other: the webhook consumer routes through endpoint resolution, the email
// consumer through subscription resolution. Everything else about the
// consume loop is shared.
//
// ============================================================================

mod resolver;

pub use resolver::RecipientResolver;

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::ResolutionError;
use crate::models::{Event, Recipient};

#[async_trait]
pub trait RoutingStrategy: Send + Sync + 'static {
    /// Consumer name used in logs, metrics and health reports.
    fn name(&self) -> &'static str;

    async fn recipients(&self, event: &Event) -> Result<Vec<Recipient>, ResolutionError>;
}

pub struct WebhookRouting {
    resolver: Arc<RecipientResolver>,
}

impl WebhookRouting {
    pub fn new(resolver: Arc<RecipientResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl RoutingStrategy for WebhookRouting {
    fn name(&self) -> &'static str {
        "webhooks"
    }

    async fn recipients(&self, event: &Event) -> Result<Vec<Recipient>, ResolutionError> {
        let endpoints = self.resolver.resolve_webhooks(event).await?;
        Ok(endpoints.into_iter().map(Recipient::Webhook).collect())
    }
}

pub struct EmailRouting {
    resolver: Arc<RecipientResolver>,
}

impl EmailRouting {
    pub fn new(resolver: Arc<RecipientResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl RoutingStrategy for EmailRouting {
    fn name(&self) -> &'static str {
        "email-subscriptions"
    }

    async fn recipients(&self, event: &Event) -> Result<Vec<Recipient>, ResolutionError> {
        let subscriptions = self.resolver.resolve_emails(event).await?;
        Ok(subscriptions.into_iter().map(Recipient::Email).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{event, subscription, webhook};
    use crate::store::InMemoryEndpointStore;

    #[tokio::test]
    async fn test_each_strategy_only_sees_its_channel() {
        let store = InMemoryEndpointStore::new();
        store.add_endpoint(webhook("acc1", "http://hook"));
        store.add_subscription(subscription("acc1", "alice", "deploy.completed"));
        let resolver = Arc::new(RecipientResolver::new(Arc::new(store)));
        let event = event("acc1", "deploy.completed");

        let webhooks = WebhookRouting::new(resolver.clone()).recipients(&event).await.unwrap();
        let emails = EmailRouting::new(resolver).recipients(&event).await.unwrap();

        assert_eq!(webhooks.len(), 1);
        assert!(matches!(webhooks[0], Recipient::Webhook(_)));
        assert_eq!(emails.len(), 1);
        assert!(matches!(emails[0], Recipient::Email(_)));
    }
}
