// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the notification consumers
// ============================================================================
//
// Every series carries the consumer name ("webhooks", "email-subscriptions")
// so the two independently-lifecycled consumers can be told apart.
//
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Consumption
    pub messages_consumed: IntCounterVec,
    pub messages_skipped: IntCounterVec,
    pub messages_committed: IntCounterVec,
    pub resolution_failures: IntCounterVec,
    pub consumer_state: IntGaugeVec,

    // Delivery
    pub deliveries: IntCounterVec,
    pub delivery_attempts: IntCounterVec,
    pub delivery_duration: HistogramVec,
    pub in_flight_deliveries: IntGaugeVec,
    pub tripped_webhook_targets: IntGauge,
    pub dead_letters: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let messages_consumed = IntCounterVec::new(
            Opts::new("notification_messages_consumed_total", "Messages pulled from the event source"),
            &["consumer"],
        )?;
        registry.register(Box::new(messages_consumed.clone()))?;

        let messages_skipped = IntCounterVec::new(
            Opts::new("notification_messages_skipped_total", "Messages skipped without dispatch"),
            &["consumer", "reason"],
        )?;
        registry.register(Box::new(messages_skipped.clone()))?;

        let messages_committed = IntCounterVec::new(
            Opts::new("notification_messages_committed_total", "Messages whose offset was committed"),
            &["consumer"],
        )?;
        registry.register(Box::new(messages_committed.clone()))?;

        let resolution_failures = IntCounterVec::new(
            Opts::new(
                "notification_resolution_failures_total",
                "Failed recipient lookups against the endpoint store",
            ),
            &["consumer"],
        )?;
        registry.register(Box::new(resolution_failures.clone()))?;

        let consumer_state = IntGaugeVec::new(
            Opts::new(
                "notification_consumer_state",
                "Consumer lifecycle state (0=Stopped, 1=Starting, 2=Running, 3=Stopping)",
            ),
            &["consumer"],
        )?;
        registry.register(Box::new(consumer_state.clone()))?;

        let deliveries = IntCounterVec::new(
            Opts::new("notification_deliveries_total", "Per-recipient delivery outcomes"),
            &["consumer", "channel", "outcome"],
        )?;
        registry.register(Box::new(deliveries.clone()))?;

        let delivery_attempts = IntCounterVec::new(
            Opts::new("notification_delivery_attempts_total", "Delivery attempts including retries"),
            &["channel"],
        )?;
        registry.register(Box::new(delivery_attempts.clone()))?;

        let delivery_duration = HistogramVec::new(
            HistogramOpts::new(
                "notification_delivery_duration_seconds",
                "Time from first attempt to terminal outcome",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["channel"],
        )?;
        registry.register(Box::new(delivery_duration.clone()))?;

        let in_flight_deliveries = IntGaugeVec::new(
            Opts::new("notification_in_flight_deliveries", "Deliveries currently running"),
            &["consumer"],
        )?;
        registry.register(Box::new(in_flight_deliveries.clone()))?;

        let tripped_webhook_targets = IntGauge::new(
            "notification_tripped_webhook_targets",
            "Webhook targets whose circuit breaker is open or half-open",
        )?;
        registry.register(Box::new(tripped_webhook_targets.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new("notification_dead_letters_total", "Terminal failures sent to the dead-letter topic"),
            &["channel"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        Ok(Self {
            registry,
            messages_consumed,
            messages_skipped,
            messages_committed,
            resolution_failures,
            consumer_state,
            deliveries,
            delivery_attempts,
            delivery_duration,
            in_flight_deliveries,
            tripped_webhook_targets,
            dead_letters,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_consumed(&self, consumer: &str) {
        self.messages_consumed.with_label_values(&[consumer]).inc();
    }

    pub fn record_skipped(&self, consumer: &str, reason: &str) {
        self.messages_skipped.with_label_values(&[consumer, reason]).inc();
    }

    pub fn record_committed(&self, consumer: &str, count: u64) {
        self.messages_committed.with_label_values(&[consumer]).inc_by(count);
    }

    pub fn record_resolution_failure(&self, consumer: &str) {
        self.resolution_failures.with_label_values(&[consumer]).inc();
    }

    pub fn set_consumer_state(&self, consumer: &str, state: i64) {
        self.consumer_state.with_label_values(&[consumer]).set(state);
    }

    /// Helper to record one recipient reaching a terminal state
    pub fn record_delivery(
        &self,
        consumer: &str,
        channel: &str,
        outcome: &str,
        attempts: u32,
        duration_secs: f64,
    ) {
        self.deliveries.with_label_values(&[consumer, channel, outcome]).inc();
        self.delivery_attempts
            .with_label_values(&[channel])
            .inc_by(u64::from(attempts));
        self.delivery_duration
            .with_label_values(&[channel])
            .observe(duration_secs);
    }

    pub fn delivery_started(&self, consumer: &str) {
        self.in_flight_deliveries.with_label_values(&[consumer]).inc();
    }

    pub fn delivery_finished(&self, consumer: &str) {
        self.in_flight_deliveries.with_label_values(&[consumer]).dec();
    }

    pub fn set_tripped_webhook_targets(&self, count: usize) {
        self.tripped_webhook_targets.set(count as i64);
    }

    pub fn record_dead_letter(&self, channel: &str) {
        self.dead_letters.with_label_values(&[channel]).inc();
    }
}
