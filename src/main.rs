use kameo::Actor;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod app;
mod config;
mod consumer;
mod dispatch;
mod errors;
mod events;
mod health;
mod messaging;
mod metrics;
mod models;
mod routing;
mod store;
mod utils;

use app::NotificationService;
use config::AppConfig;
use consumer::TopicConsumer;
use dispatch::{HttpEmailSender, NotificationDispatcher, WebhookClient};
use health::{HealthMonitorActor, HealthReporter};
use messaging::{DeadLetterPublisher, KafkaSourceConfig, KafkaSourceFactory, RedpandaClient};
use routing::{EmailRouting, RecipientResolver, WebhookRouting};
use store::PgEndpointStore;

// Only used in testing mode, where consumers never run and nothing connects
const OFFLINE_DATABASE_URL: &str = "postgres://localhost/notifications";
const OFFLINE_EMAIL_SERVICE_URL: &str = "http://localhost/email";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,notifications_backend=debug")),
        )
        .init();

    tracing::info!("🚀 Starting notifications backend");

    let config = AppConfig::from_env()?;

    // === 1. Metrics ===
    let metrics = Arc::new(metrics::Metrics::new()?);
    tracing::info!(
        "📊 Metrics registry created with {} metrics",
        metrics.registry().gather().len()
    );

    // === 2. Dead-letter producer (optional) ===
    let dead_letters = match &config.kafka.dead_letter_topic {
        Some(topic) => {
            tracing::info!(topic = %topic, "Dead-letter publishing enabled");
            Some(Arc::new(RedpandaClient::new(&config.kafka.brokers, topic.clone())?))
        }
        None => None,
    };

    // === 3. Health monitor + metrics/health HTTP server ===
    let health_monitor = HealthMonitorActor::spawn(HealthMonitorActor::new(dead_letters.clone()));

    // Start metrics HTTP server in background thread
    let metrics_registry = metrics.registry().clone();
    let metrics_health = health_monitor.clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Metrics server runtime error: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) =
                metrics::start_metrics_server(metrics_registry, metrics_health, metrics_port).await
            {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 4. Endpoint store & routing ===
    let store = PgEndpointStore::connect_lazy(
        config.database_url.as_deref().unwrap_or(OFFLINE_DATABASE_URL),
        config.database_max_connections,
    )?;
    let resolver = Arc::new(RecipientResolver::new(Arc::new(store)));

    // === 5. Delivery ===
    let webhook_client = Arc::new(WebhookClient::new(config.delivery.webhook_timeout)?);
    let email_sender = Arc::new(HttpEmailSender::new(
        config
            .delivery
            .email_service_url
            .as_deref()
            .unwrap_or(OFFLINE_EMAIL_SERVICE_URL),
        config.delivery.webhook_timeout,
    )?);

    let dispatcher = |consumer: &'static str| {
        let dispatcher = NotificationDispatcher::new(
            consumer,
            webhook_client.clone(),
            email_sender.clone(),
            config.delivery.retry.clone(),
            config.consumer.max_in_flight_deliveries,
            metrics.clone(),
        );
        match &dead_letters {
            Some(producer) => {
                let publisher: Arc<dyn DeadLetterPublisher> = producer.clone();
                dispatcher.with_dead_letters(publisher)
            }
            None => dispatcher,
        }
    };

    // === 6. Consumers (one consumer group each) ===
    let reporter = HealthReporter::new(health_monitor.clone());
    let webhook_sources = KafkaSourceFactory::new(KafkaSourceConfig::new(
        &config.kafka.brokers,
        format!("{}-webhooks", config.kafka.group_id),
    ));
    let email_sources = KafkaSourceFactory::new(KafkaSourceConfig::new(
        &config.kafka.brokers,
        format!("{}-email", config.kafka.group_id),
    ));

    let webhook_consumer = TopicConsumer::with_health(
        WebhookRouting::new(resolver.clone()),
        config.kafka.webhook_topic.clone(),
        Arc::new(webhook_sources),
        dispatcher("webhooks"),
        config.consumer.clone(),
        metrics.clone(),
        reporter.clone(),
    );
    let email_consumer = TopicConsumer::with_health(
        EmailRouting::new(resolver),
        config.kafka.email_topic.clone(),
        Arc::new(email_sources),
        dispatcher("email-subscriptions"),
        config.consumer.clone(),
        metrics.clone(),
        reporter,
    );

    let mut service = NotificationService::new(webhook_consumer, email_consumer, !config.testing);
    if !service.consumers_enabled() {
        tracing::warn!("TESTING is set: event consumers will not be started");
    }

    // === 7. Run until interrupted ===
    let start_errors = service.start().await;
    if !start_errors.is_empty() {
        tracing::error!(failed = start_errors.len(), "Some consumers failed to start");
    }

    tracing::info!("⏳ Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    service.shutdown().await;
    let _ = health_monitor.stop_gracefully().await;

    tracing::info!("👋 Notifications backend stopped");
    Ok(())
}
