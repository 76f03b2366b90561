use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::EndpointStore;
use crate::errors::StoreError;
use crate::models::{
    AccountId, Endpoint, EndpointType, HttpMethod, Subscription, SubscriptionChannel,
    WebhookProperties,
};

// ============================================================================
// Postgres-backed Endpoint Store
// ============================================================================
//
// Tables (owned and migrated by the CRUD API):
//   endpoints(id, account_id, endpoint_type, name, description, enabled, event_type)
//   endpoint_webhooks(endpoint_id, url, method, secret_token, disable_ssl_verification)
//   endpoint_email_subscriptions(account_id, user_id, event_type, enabled)
//
// ============================================================================

const ENDPOINTS_QUERY: &str = "\
    SELECT e.id, e.account_id, e.endpoint_type, e.name, e.description, e.enabled, \
           e.event_type, w.url, w.method, w.secret_token, w.disable_ssl_verification \
    FROM endpoints e \
    LEFT JOIN endpoint_webhooks w ON w.endpoint_id = e.id \
    WHERE e.account_id = $1 AND e.endpoint_type = $2 AND e.enabled";

const SUBSCRIPTIONS_QUERY: &str = "\
    SELECT account_id, user_id, event_type, enabled \
    FROM endpoint_email_subscriptions \
    WHERE account_id = $1 AND event_type = $2";

pub struct PgEndpointStore {
    pool: PgPool,
}

impl PgEndpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool that connects on first use, so startup does not depend on
    /// the database being reachable.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }
}

/// Columns of one endpoint row, before validation.
#[derive(Debug, Clone)]
struct EndpointRecord {
    id: Uuid,
    account_id: String,
    endpoint_type: String,
    name: String,
    description: Option<String>,
    enabled: bool,
    event_type: Option<String>,
    url: Option<String>,
    method: Option<String>,
    secret_token: Option<String>,
    disable_ssl_verification: Option<bool>,
}

impl EndpointRecord {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            endpoint_type: row.try_get("endpoint_type")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            enabled: row.try_get("enabled")?,
            event_type: row.try_get("event_type")?,
            url: row.try_get("url")?,
            method: row.try_get("method")?,
            secret_token: row.try_get("secret_token")?,
            disable_ssl_verification: row.try_get("disable_ssl_verification")?,
        })
    }
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = StoreError;

    fn try_from(record: EndpointRecord) -> Result<Self, Self::Error> {
        let id = record.id;
        let corrupt = |reason: String| StoreError::Corrupt {
            entity: "endpoint",
            reason,
        };

        let endpoint_type = EndpointType::parse(&record.endpoint_type).ok_or_else(|| {
            corrupt(format!("{} has unknown type {:?}", id, record.endpoint_type))
        })?;

        let method = match record.method.as_deref() {
            None | Some("POST") => HttpMethod::Post,
            Some("PUT") => HttpMethod::Put,
            Some(other) => return Err(corrupt(format!("{} has unsupported method {:?}", id, other))),
        };

        let target = match (endpoint_type, record.url) {
            (_, Some(url)) => url,
            (EndpointType::Webhook, None) => return Err(corrupt(format!("webhook {} has no url", id))),
            (EndpointType::Email, None) => String::new(),
        };

        Ok(Endpoint {
            id,
            account_id: AccountId::new(record.account_id),
            endpoint_type,
            name: record.name,
            description: record.description,
            target,
            enabled: record.enabled,
            event_type_filter: record.event_type,
            properties: WebhookProperties {
                method,
                secret_token: record.secret_token,
                disable_tls_verification: record.disable_ssl_verification.unwrap_or(false),
            },
        })
    }
}

/// Validate records one by one. A bad row is logged and left out; it must not
/// hide the account's other endpoints.
fn usable_endpoints(records: impl IntoIterator<Item = EndpointRecord>) -> Vec<Endpoint> {
    records
        .into_iter()
        .filter_map(|record| {
            let endpoint_id = record.id;
            match Endpoint::try_from(record) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::warn!(
                        endpoint_id = %endpoint_id,
                        error = %e,
                        "Skipping corrupt endpoint record"
                    );
                    None
                }
            }
        })
        .collect()
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    Ok(Subscription {
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        user_id: row.try_get("user_id")?,
        event_type: row.try_get("event_type")?,
        channel: SubscriptionChannel::Email,
        enabled: row.try_get("enabled")?,
    })
}

#[async_trait]
impl EndpointStore for PgEndpointStore {
    async fn list_endpoints(
        &self,
        account_id: &AccountId,
        endpoint_type: EndpointType,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query(ENDPOINTS_QUERY)
            .bind(account_id.as_str())
            .bind(endpoint_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(EndpointRecord::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(usable_endpoints(records))
    }

    async fn list_subscriptions(
        &self,
        account_id: &AccountId,
        event_type: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(SUBSCRIPTIONS_QUERY)
            .bind(account_id.as_str())
            .bind(event_type)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(subscription_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: Option<&str>, method: Option<&str>) -> EndpointRecord {
        EndpointRecord {
            id: Uuid::new_v4(),
            account_id: "acc1".to_string(),
            endpoint_type: "webhook".to_string(),
            name: "hook".to_string(),
            description: None,
            enabled: true,
            event_type: None,
            url: url.map(str::to_string),
            method: method.map(str::to_string),
            secret_token: None,
            disable_ssl_verification: None,
        }
    }

    #[test]
    fn test_corrupt_record_does_not_hide_valid_ones() {
        let valid = record(Some("https://hooks.example/a"), Some("PUT"));
        let valid_id = valid.id;

        let endpoints = usable_endpoints(vec![
            record(None, Some("POST")),
            valid,
            record(Some("https://hooks.example/b"), Some("PATCH")),
        ]);

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id, valid_id);
        assert_eq!(endpoints[0].properties.method, HttpMethod::Put);
    }

    #[test]
    fn test_record_conversion_rejects_bad_rows() {
        let mut unknown_type = record(Some("https://hooks.example/a"), None);
        unknown_type.endpoint_type = "pager".to_string();

        assert!(matches!(
            Endpoint::try_from(unknown_type),
            Err(StoreError::Corrupt { entity: "endpoint", .. })
        ));
        assert!(Endpoint::try_from(record(None, None)).is_err());

        let endpoint = Endpoint::try_from(record(Some("https://hooks.example/a"), None)).unwrap();
        assert_eq!(endpoint.properties.method, HttpMethod::Post);
        assert!(!endpoint.properties.disable_tls_verification);
    }
}
