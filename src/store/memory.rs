use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use super::EndpointStore;
use crate::errors::StoreError;
use crate::models::{AccountId, Endpoint, EndpointType, Subscription};

/// In-process store double. Filters by account, type and event type only, so
/// the resolver's own `enabled` check is exercised.
#[derive(Default)]
pub struct InMemoryEndpointStore {
    endpoints: RwLock<Vec<Endpoint>>,
    subscriptions: RwLock<Vec<Subscription>>,
    unavailable: AtomicBool,
    queries: AtomicU32,
}

impl InMemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) {
        self.endpoints.write().unwrap().push(endpoint);
    }

    pub fn add_subscription(&self, subscription: Subscription) {
        self.subscriptions.write().unwrap().push(subscription);
    }

    /// Simulate an outage: every query fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointStore for InMemoryEndpointStore {
    async fn list_endpoints(
        &self,
        account_id: &AccountId,
        endpoint_type: EndpointType,
    ) -> Result<Vec<Endpoint>, StoreError> {
        self.check()?;
        Ok(self
            .endpoints
            .read()
            .unwrap()
            .iter()
            .filter(|e| &e.account_id == account_id && e.endpoint_type == endpoint_type)
            .cloned()
            .collect())
    }

    async fn list_subscriptions(
        &self,
        account_id: &AccountId,
        event_type: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.check()?;
        Ok(self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| &s.account_id == account_id && s.event_type == event_type)
            .cloned()
            .collect())
    }
}
