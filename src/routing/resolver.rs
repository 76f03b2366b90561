use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::ResolutionError;
use crate::models::{Endpoint, EndpointType, Event, RecipientSet, Subscription};
use crate::store::EndpointStore;

// ============================================================================
// Recipient Resolver
// ============================================================================
//
// Answers "who should hear about this event?". The store is queried fresh
// for every event and its results are filtered again here: a record from
// another account, a disabled record, or an endpoint whose filter does not
// match never becomes a recipient, whatever the store returned.
//
// ============================================================================

pub struct RecipientResolver {
    store: Arc<dyn EndpointStore>,
}

impl RecipientResolver {
    pub fn new(store: Arc<dyn EndpointStore>) -> Self {
        Self { store }
    }

    /// Webhook and email recipients together.
    pub async fn resolve(&self, event: &Event) -> Result<RecipientSet, ResolutionError> {
        let (webhook_targets, email_targets) =
            tokio::try_join!(self.resolve_webhooks(event), self.resolve_emails(event))?;

        Ok(RecipientSet {
            webhook_targets,
            email_targets,
        })
    }

    /// Enabled webhook endpoints of the event's account that accept its type.
    pub async fn resolve_webhooks(&self, event: &Event) -> Result<Vec<Endpoint>, ResolutionError> {
        let endpoints = self
            .store
            .list_endpoints(&event.account_id, EndpointType::Webhook)
            .await?;

        let mut seen = HashSet::new();
        let targets: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|endpoint| {
                if endpoint.account_id != event.account_id {
                    tracing::warn!(
                        endpoint_id = %endpoint.id,
                        expected_account = %event.account_id,
                        actual_account = %endpoint.account_id,
                        "Store returned an endpoint from another account, ignoring it"
                    );
                    return false;
                }
                endpoint.endpoint_type == EndpointType::Webhook
                    && endpoint.enabled
                    && endpoint.accepts(&event.event_type)
            })
            .filter(|endpoint| seen.insert(endpoint.id))
            .collect();

        tracing::debug!(
            account_id = %event.account_id,
            event_type = %event.event_type,
            webhooks = targets.len(),
            "Resolved webhook recipients"
        );

        Ok(targets)
    }

    /// Enabled email subscriptions for exactly `(account_id, event_type)`.
    /// Event types nobody subscribed to resolve to nobody.
    pub async fn resolve_emails(&self, event: &Event) -> Result<Vec<Subscription>, ResolutionError> {
        let subscriptions = self
            .store
            .list_subscriptions(&event.account_id, &event.event_type)
            .await?;

        let mut seen = HashSet::new();
        let targets: Vec<Subscription> = subscriptions
            .into_iter()
            .filter(|subscription| {
                if subscription.account_id != event.account_id {
                    tracing::warn!(
                        user_id = %subscription.user_id,
                        expected_account = %event.account_id,
                        actual_account = %subscription.account_id,
                        "Store returned a subscription from another account, ignoring it"
                    );
                    return false;
                }
                subscription.enabled && subscription.event_type == event.event_type
            })
            .filter(|subscription| seen.insert(subscription.user_id.clone()))
            .collect();

        tracing::debug!(
            account_id = %event.account_id,
            event_type = %event.event_type,
            emails = targets.len(),
            "Resolved email recipients"
        );

        Ok(targets)
    }
}
