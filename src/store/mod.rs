// ============================================================================
// Endpoint Store
// ============================================================================
//
// Read-only view over endpoint and subscription records. The CRUD API owns
// writes; consumers only query, always fresh (no caching on this side).
//
// ============================================================================

mod postgres;
#[cfg(test)]
mod memory;

pub use postgres::PgEndpointStore;
#[cfg(test)]
pub use memory::InMemoryEndpointStore;

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::models::{AccountId, Endpoint, EndpointType, Subscription};

#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// All endpoints of `endpoint_type` registered for the account.
    async fn list_endpoints(
        &self,
        account_id: &AccountId,
        endpoint_type: EndpointType,
    ) -> Result<Vec<Endpoint>, StoreError>;

    /// Subscriptions for the account matching `event_type` exactly.
    async fn list_subscriptions(
        &self,
        account_id: &AccountId,
        event_type: &str,
    ) -> Result<Vec<Subscription>, StoreError>;
}
