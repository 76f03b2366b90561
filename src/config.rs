use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::utils::RetryConfig;

// ============================================================================
// Application Configuration
// ============================================================================
//
// Loaded once in `main` from the process environment (a `.env` file is
// honoured through dotenvy). Nothing below `main` reads the environment.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub webhook_topic: String,
    pub email_topic: String,
    pub dead_letter_topic: Option<String>,
}

/// Knobs shared by both topic consumers.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages pulled but not yet committed
    pub max_in_flight_messages: usize,
    /// Deliveries running at once across all messages of one consumer
    pub max_in_flight_deliveries: usize,
    pub shutdown_grace: Duration,
    pub max_consecutive_source_errors: u32,
    /// Pacing for endpoint-store retries
    pub resolution_backoff: RetryConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight_messages: 16,
            max_in_flight_deliveries: 32,
            shutdown_grace: Duration::from_secs(10),
            max_consecutive_source_errors: 10,
            resolution_backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub retry: RetryConfig,
    pub webhook_timeout: Duration,
    pub email_service_url: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            webhook_timeout: Duration::from_secs(10),
            email_service_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub kafka: KafkaConfig,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub metrics_port: u16,
    /// Offline/test mode: consumers are never started
    pub testing: bool,
    pub consumer: ConsumerConfig,
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let testing = vars.parse_or("TESTING", false)?;

        let webhook_topic = vars.string_or("WEBHOOK_TOPIC", "platform.notifications.ingress");
        let kafka = KafkaConfig {
            brokers: vars.string_or("KAFKA_BROKERS", "localhost:9092"),
            group_id: vars.string_or("KAFKA_GROUP_ID", "notifications-backend"),
            email_topic: vars.string_or("EMAIL_TOPIC", &webhook_topic),
            webhook_topic,
            dead_letter_topic: vars.get("DEAD_LETTER_TOPIC"),
        };

        let database_url = vars.get("DATABASE_URL");
        let email_service_url = vars.get("EMAIL_SERVICE_URL");
        if !testing {
            if database_url.is_none() {
                return Err(ConfigError::Missing("DATABASE_URL"));
            }
            if email_service_url.is_none() {
                return Err(ConfigError::Missing("EMAIL_SERVICE_URL"));
            }
        }

        let defaults = ConsumerConfig::default();
        let consumer = ConsumerConfig {
            max_in_flight_messages: vars
                .parse_or("MAX_IN_FLIGHT_MESSAGES", defaults.max_in_flight_messages)?
                .max(1),
            max_in_flight_deliveries: vars
                .parse_or("MAX_IN_FLIGHT_DELIVERIES", defaults.max_in_flight_deliveries)?
                .max(1),
            shutdown_grace: Duration::from_secs(vars.parse_or("SHUTDOWN_GRACE_SECS", 10)?),
            max_consecutive_source_errors: vars.parse_or(
                "MAX_CONSECUTIVE_SOURCE_ERRORS",
                defaults.max_consecutive_source_errors,
            )?,
            resolution_backoff: defaults.resolution_backoff,
        };

        let retry_defaults = RetryConfig::default();
        let delivery = DeliveryConfig {
            retry: RetryConfig {
                max_attempts: vars.parse_or("DELIVERY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
                initial_delay: Duration::from_millis(
                    vars.parse_or("DELIVERY_INITIAL_BACKOFF_MS", 200)?,
                ),
                max_delay: Duration::from_millis(vars.parse_or("DELIVERY_MAX_BACKOFF_MS", 10_000)?),
                multiplier: retry_defaults.multiplier,
            },
            webhook_timeout: Duration::from_secs(vars.parse_or("WEBHOOK_TIMEOUT_SECS", 10)?),
            email_service_url,
        };

        Ok(Self {
            kafka,
            database_url,
            database_max_connections: vars.parse_or("DATABASE_MAX_CONNECTIONS", 5)?,
            metrics_port: vars.parse_or("METRICS_PORT", 9090)?,
            testing,
            consumer,
            delivery,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value: raw }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_testing_mode_needs_no_external_urls() {
        let config = load(&[("TESTING", "true")]).unwrap();

        assert!(config.testing);
        assert_eq!(config.kafka.webhook_topic, "platform.notifications.ingress");
        assert_eq!(config.kafka.email_topic, config.kafka.webhook_topic);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.delivery.retry.max_attempts, 3);
    }

    #[test]
    fn test_production_mode_requires_database() {
        let err = load(&[("EMAIL_SERVICE_URL", "http://mail")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/notifications"),
            ("EMAIL_SERVICE_URL", "http://mail"),
            ("EMAIL_TOPIC", "platform.notifications.email"),
            ("MAX_IN_FLIGHT_DELIVERIES", "4"),
            ("SHUTDOWN_GRACE_SECS", "3"),
            ("DELIVERY_MAX_ATTEMPTS", "5"),
        ])
        .unwrap();

        assert_eq!(config.kafka.email_topic, "platform.notifications.email");
        assert_eq!(config.consumer.max_in_flight_deliveries, 4);
        assert_eq!(config.consumer.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.delivery.retry.max_attempts, 5);
    }

    #[test]
    fn test_invalid_number_names_the_variable() {
        let err = load(&[("TESTING", "true"), ("METRICS_PORT", "ninety")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "METRICS_PORT", .. }));
    }
}
