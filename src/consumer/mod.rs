mod commit;
mod lifecycle;

pub use commit::{CommitPoint, CommitTracker};
pub use lifecycle::{ConsumerState, ShutdownReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::ConsumerConfig;
use crate::dispatch::NotificationDispatcher;
use crate::errors::{ConsumerLifecycleError, SourceError};
use crate::events::EventDecoder;
use crate::health::{HealthReporter, HealthStatus};
use crate::messaging::{EventSource, EventSourceFactory, MessagePosition, RawMessage};
use crate::metrics::Metrics;
use crate::models::Event;
use crate::routing::RoutingStrategy;
use crate::utils::RetryConfig;

// ============================================================================
// Topic Consumer
// ============================================================================
//
// One generic consumer, parameterised by how recipients are found. Each
// instance owns its subscription, its consume loop task and its lifecycle;
// two instances share nothing but the endpoint store behind their routing.
//
// Loop:  pull -> decode -> spawn(resolve -> dispatch_all) -> commit
//
// Message tasks finish in any order; `CommitTracker` only lets the commit
// point move over a contiguous run of finished offsets. Intake is bounded by
// uncommitted messages, not running tasks, so a message that never finishes
// stalls the loop instead of growing the backlog behind it.
//
// ============================================================================

/// Consecutive resolution failures before a consumer reports Unhealthy.
const UNHEALTHY_AFTER_RESOLUTION_FAILURES: u32 = 5;

/// How a single message's processing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    /// Every recipient reached a terminal state
    Completed,
    /// Shutdown interrupted it before dispatch finished
    Abandoned,
}

/// Shared, immutable pieces the loop and its message tasks read from.
struct ConsumerContext<R> {
    name: &'static str,
    routing: R,
    dispatcher: NotificationDispatcher,
    decoder: EventDecoder,
    config: ConsumerConfig,
    metrics: Arc<Metrics>,
    health: HealthReporter,
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<ShutdownReport, SourceError>>,
}

pub struct TopicConsumer<R: RoutingStrategy> {
    context: Arc<ConsumerContext<R>>,
    topic: String,
    sources: Arc<dyn EventSourceFactory>,
    state: ConsumerState,
    running: Option<RunningLoop>,
}

impl<R: RoutingStrategy> TopicConsumer<R> {
    pub fn new(
        routing: R,
        topic: impl Into<String>,
        sources: Arc<dyn EventSourceFactory>,
        dispatcher: NotificationDispatcher,
        config: ConsumerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_health(
            routing,
            topic,
            sources,
            dispatcher,
            config,
            metrics,
            HealthReporter::disabled(),
        )
    }

    pub fn with_health(
        routing: R,
        topic: impl Into<String>,
        sources: Arc<dyn EventSourceFactory>,
        dispatcher: NotificationDispatcher,
        config: ConsumerConfig,
        metrics: Arc<Metrics>,
        health: HealthReporter,
    ) -> Self {
        let name = routing.name();
        metrics.set_consumer_state(name, ConsumerState::Stopped.as_gauge());

        Self {
            context: Arc::new(ConsumerContext {
                name,
                routing,
                dispatcher,
                decoder: EventDecoder::new(),
                config,
                metrics,
                health,
            }),
            topic: topic.into(),
            sources,
            state: ConsumerState::Stopped,
            running: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.context.name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// True once the consume loop has stopped on its own (source failures).
    pub fn has_halted(&self) -> bool {
        self.state == ConsumerState::Running
            && self
                .running
                .as_ref()
                .map(|running| running.handle.is_finished())
                .unwrap_or(false)
    }

    fn transition(&mut self, next: ConsumerState) {
        tracing::info!(
            consumer = self.context.name,
            topic = %self.topic,
            from = ?self.state,
            to = ?next,
            "Consumer state transition"
        );
        self.state = next;
        self.context
            .metrics
            .set_consumer_state(self.context.name, next.as_gauge());
    }

    /// Subscribe and begin consuming. Fails unless the consumer is stopped.
    pub async fn start(&mut self) -> Result<(), ConsumerLifecycleError> {
        if self.state != ConsumerState::Stopped {
            return Err(ConsumerLifecycleError::AlreadyStarted {
                consumer: self.context.name,
                state: self.state,
            });
        }

        self.transition(ConsumerState::Starting);

        let source = match self.sources.subscribe(&self.topic).await {
            Ok(source) => source,
            Err(source) => {
                tracing::error!(
                    consumer = self.context.name,
                    topic = %self.topic,
                    error = %source,
                    "Failed to subscribe"
                );
                self.transition(ConsumerState::Stopped);
                return Err(ConsumerLifecycleError::Subscribe {
                    consumer: self.context.name,
                    source,
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.context.clone(), source, shutdown_rx));
        self.running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });

        self.transition(ConsumerState::Running);
        self.context
            .health
            .report(self.context.name, HealthStatus::Healthy, Some(format!("consuming {}", self.topic)))
            .await;

        tracing::info!(consumer = self.context.name, topic = %self.topic, "🚀 Consumer started");
        Ok(())
    }

    /// Stop pulling, give in-flight messages the grace period, then abandon
    /// what is left. Abandoned messages are never committed.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, ConsumerLifecycleError> {
        if self.state != ConsumerState::Running {
            return Err(ConsumerLifecycleError::NotRunning {
                consumer: self.context.name,
            });
        }
        let Some(running) = self.running.take() else {
            self.transition(ConsumerState::Stopped);
            return Err(ConsumerLifecycleError::NotRunning {
                consumer: self.context.name,
            });
        };

        self.transition(ConsumerState::Stopping);

        // The loop may already be gone after a halt
        let _ = running.shutdown_tx.send(true);
        let joined = running.handle.await;

        self.transition(ConsumerState::Stopped);
        if matches!(joined, Ok(Ok(_))) {
            // A halted loop keeps its Unhealthy report
            self.context
                .health
                .report(self.context.name, HealthStatus::Degraded("stopped".to_string()), None)
                .await;
        }

        match joined {
            Ok(Ok(report)) => {
                tracing::info!(
                    consumer = self.context.name,
                    completed = report.completed,
                    abandoned = report.abandoned,
                    "🛑 Consumer stopped"
                );
                Ok(report)
            }
            Ok(Err(source)) => Err(ConsumerLifecycleError::Halted {
                consumer: self.context.name,
                source,
            }),
            Err(e) => Err(ConsumerLifecycleError::LoopPanicked {
                consumer: self.context.name,
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// Consume loop
// ============================================================================

struct LoopState {
    tasks: JoinSet<MessageOutcome>,
    positions: HashMap<tokio::task::Id, MessagePosition>,
    tracker: CommitTracker,
}

async fn run_loop<R: RoutingStrategy>(
    context: Arc<ConsumerContext<R>>,
    source: Arc<dyn EventSource>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ShutdownReport, SourceError> {
    let name = context.name;
    let max_in_flight = context.config.max_in_flight_messages.max(1);
    let max_source_errors = context.config.max_consecutive_source_errors.max(1);

    let mut state = LoopState {
        tasks: JoinSet::new(),
        positions: HashMap::new(),
        tracker: CommitTracker::default(),
    };
    let mut source_errors: u32 = 0;
    // Set while backing off after a source error
    let mut resume_at: Option<Instant> = None;
    let mut source_backoff = RetryConfig {
        max_attempts: u32::MAX,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    }
    .backoff();

    let halted = loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => break None,

            Some(joined) = state.tasks.join_next_with_id(), if !state.tasks.is_empty() => {
                on_message_finished(&context, source.as_ref(), &mut state, joined);
            }

            _ = tokio::time::sleep_until(resume_at.unwrap_or_else(Instant::now)), if resume_at.is_some() => {
                resume_at = None;
            }

            next = source.next_message(), if resume_at.is_none() && state.tracker.pending() < max_in_flight => {
                match next {
                    Ok(message) => {
                        if source_errors > 0 {
                            context.health.report(name, HealthStatus::Healthy, None).await;
                            source_backoff.reset(Duration::from_millis(100));
                        }
                        source_errors = 0;
                        on_message(&context, source.as_ref(), &mut state, message, &shutdown);
                    }
                    Err(e) => {
                        source_errors += 1;
                        tracing::warn!(
                            consumer = name,
                            consecutive = source_errors,
                            error = %e,
                            "Event source error"
                        );

                        if source_errors >= max_source_errors {
                            tracing::error!(
                                consumer = name,
                                consecutive = source_errors,
                                "Too many consecutive source errors, halting consume loop"
                            );
                            context
                                .health
                                .report(name, HealthStatus::Unhealthy(format!("halted: {}", e)), None)
                                .await;
                            break Some(e);
                        }

                        context
                            .health
                            .report(name, HealthStatus::Degraded(format!("source error: {}", e)), None)
                            .await;
                        resume_at = Some(Instant::now() + source_backoff.next_delay());
                    }
                }
            }
        }
    };

    let report = drain(&context, source.as_ref(), &mut state).await;

    match halted {
        None => Ok(report),
        Some(e) => {
            tracing::warn!(
                consumer = name,
                completed = report.completed,
                abandoned = report.abandoned,
                "Consume loop halted after draining in-flight messages"
            );
            Err(e)
        }
    }
}

/// Resolves once shutdown is requested or the owning consumer is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn on_message<R: RoutingStrategy>(
    context: &Arc<ConsumerContext<R>>,
    source: &dyn EventSource,
    state: &mut LoopState,
    message: RawMessage,
    shutdown: &watch::Receiver<bool>,
) {
    let name = context.name;
    context.metrics.record_consumed(name);
    state.tracker.register(&message.position);

    match context.decoder.decode(&message) {
        Ok(event) => {
            tracing::debug!(
                consumer = name,
                topic = %message.position.topic,
                partition = message.position.partition,
                offset = message.position.offset,
                account_id = %event.account_id,
                event_type = %event.event_type,
                "📥 Event received"
            );
            let handle = state.tasks.spawn(process_event(
                context.clone(),
                Arc::new(event),
                shutdown.clone(),
            ));
            state.positions.insert(handle.id(), message.position);
        }
        Err(e) => {
            // Poison messages are skipped so the partition keeps moving
            tracing::warn!(
                consumer = name,
                topic = %message.position.topic,
                partition = message.position.partition,
                offset = message.position.offset,
                error = %e,
                "Skipping undecodable message"
            );
            context.metrics.record_skipped(name, e.reason());
            commit_completed(context, source, state, &message.position);
        }
    }
}

fn on_message_finished<R: RoutingStrategy>(
    context: &Arc<ConsumerContext<R>>,
    source: &dyn EventSource,
    state: &mut LoopState,
    joined: Result<(tokio::task::Id, MessageOutcome), JoinError>,
) -> Option<MessageOutcome> {
    match joined {
        Ok((id, outcome)) => {
            let position = state.positions.remove(&id)?;
            if outcome == MessageOutcome::Completed {
                commit_completed(context, source, state, &position);
            } else {
                tracing::info!(
                    consumer = context.name,
                    position = %position,
                    "Message abandoned, leaving it for redelivery"
                );
            }
            Some(outcome)
        }
        Err(e) => {
            let position = state.positions.remove(&e.id());
            if e.is_panic() {
                // Stays pending: the partition stops committing until restart
                // and intake halts once the uncommitted backlog is full
                tracing::error!(
                    consumer = context.name,
                    position = ?position,
                    error = %e,
                    "Message task panicked, leaving it uncommitted"
                );
            }
            Some(MessageOutcome::Abandoned)
        }
    }
}

fn commit_completed<R>(
    context: &ConsumerContext<R>,
    source: &dyn EventSource,
    state: &mut LoopState,
    position: &MessagePosition,
) {
    let Some(point) = state.tracker.complete(position) else {
        return;
    };

    match source.commit(&point.position) {
        Ok(()) => {
            context
                .metrics
                .record_committed(context.name, point.messages as u64);
            tracing::debug!(
                consumer = context.name,
                position = %point.position,
                messages = point.messages,
                "Committed"
            );
        }
        Err(e) => {
            // Redelivery covers it; the next commit point supersedes this one
            tracing::warn!(
                consumer = context.name,
                position = %point.position,
                error = %e,
                "Commit failed"
            );
        }
    }
}

/// Wait for in-flight messages until the grace deadline, then abort the rest.
async fn drain<R: RoutingStrategy>(
    context: &Arc<ConsumerContext<R>>,
    source: &dyn EventSource,
    state: &mut LoopState,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    let deadline = Instant::now() + context.config.shutdown_grace;

    if !state.tasks.is_empty() {
        tracing::info!(
            consumer = context.name,
            in_flight = state.tasks.len(),
            grace_ms = context.config.shutdown_grace.as_millis() as u64,
            "Draining in-flight messages"
        );
    }

    loop {
        match tokio::time::timeout_at(deadline, state.tasks.join_next_with_id()).await {
            Ok(Some(joined)) => match on_message_finished(context, source, state, joined) {
                Some(MessageOutcome::Completed) => report.completed += 1,
                Some(MessageOutcome::Abandoned) => report.abandoned += 1,
                None => {}
            },
            Ok(None) => break,
            Err(_) => {
                let remaining = state.tasks.len();
                tracing::warn!(
                    consumer = context.name,
                    abandoned = remaining,
                    "Shutdown grace period elapsed, abandoning in-flight messages"
                );
                state.tasks.abort_all();
                while state.tasks.join_next().await.is_some() {}
                report.abandoned += remaining;
                break;
            }
        }
    }

    report
}

// ============================================================================
// Per-message processing
// ============================================================================

async fn process_event<R: RoutingStrategy>(
    context: Arc<ConsumerContext<R>>,
    event: Arc<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> MessageOutcome {
    let name = context.name;

    let Some(recipients) = resolve_with_retry(&context, &event, &mut shutdown).await else {
        return MessageOutcome::Abandoned;
    };

    if recipients.is_empty() {
        tracing::debug!(
            consumer = name,
            account_id = %event.account_id,
            event_type = %event.event_type,
            "No recipients for event"
        );
        context.metrics.record_skipped(name, "no_recipients");
        return MessageOutcome::Completed;
    }

    let report = context
        .dispatcher
        .dispatch_all(event.clone(), recipients)
        .await;

    tracing::info!(
        consumer = name,
        account_id = %event.account_id,
        event_type = %event.event_type,
        recipients = report.total(),
        delivered = report.delivered,
        failed = report.failed,
        "📤 Event dispatched"
    );

    MessageOutcome::Completed
}

/// Keep asking the store until it answers. `None` means shutdown won.
async fn resolve_with_retry<R: RoutingStrategy>(
    context: &ConsumerContext<R>,
    event: &Event,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Vec<crate::models::Recipient>> {
    let name = context.name;
    let mut backoff = context.config.resolution_backoff.backoff();
    let mut failures: u32 = 0;

    loop {
        match context.routing.recipients(event).await {
            Ok(recipients) => {
                if failures > 0 {
                    tracing::info!(
                        consumer = name,
                        account_id = %event.account_id,
                        failures = failures,
                        "Recipient resolution recovered"
                    );
                    context.health.report(name, HealthStatus::Healthy, None).await;
                }
                return Some(recipients);
            }
            Err(e) => {
                failures += 1;
                context.metrics.record_resolution_failure(name);

                let status = if failures >= UNHEALTHY_AFTER_RESOLUTION_FAILURES {
                    HealthStatus::Unhealthy(format!("endpoint store unavailable: {}", e))
                } else {
                    HealthStatus::Degraded(format!("retrying recipient resolution: {}", e))
                };
                context.health.report(name, status, None).await;

                let delay = backoff.next_delay();
                tracing::warn!(
                    consumer = name,
                    account_id = %event.account_id,
                    event_type = %event.event_type,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Recipient resolution failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(shutdown) => return None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{RecordingEmailSender, WebhookClient};
    use crate::errors::ResolutionError;
    use crate::messaging::{MemorySource, MemorySourceFactory};
    use crate::models::fixtures::{subscription, webhook};
    use crate::models::Recipient;
    use crate::routing::{EmailRouting, RecipientResolver, WebhookRouting};
    use crate::store::InMemoryEndpointStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn envelope(account: &str, event_type: &str) -> serde_json::Value {
        serde_json::json!({
            "version": 1,
            "account_id": account,
            "event_type": event_type,
            "payload": {"build": 7}
        })
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            max_in_flight_messages: 8,
            max_in_flight_deliveries: 8,
            shutdown_grace: Duration::from_secs(2),
            max_consecutive_source_errors: 3,
            resolution_backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
            },
        }
    }

    struct Harness {
        source: Arc<MemorySource>,
        store: Arc<InMemoryEndpointStore>,
        email: Arc<RecordingEmailSender>,
        metrics: Arc<Metrics>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                source: MemorySource::new("events"),
                store: Arc::new(InMemoryEndpointStore::new()),
                email: Arc::new(RecordingEmailSender::new()),
                metrics: Arc::new(Metrics::new().unwrap()),
            }
        }

        fn dispatcher(&self, name: &'static str) -> NotificationDispatcher {
            NotificationDispatcher::new(
                name,
                Arc::new(WebhookClient::new(Duration::from_secs(10)).unwrap()),
                self.email.clone(),
                RetryConfig {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    multiplier: 2.0,
                },
                8,
                self.metrics.clone(),
            )
        }

        fn resolver(&self) -> Arc<RecipientResolver> {
            Arc::new(RecipientResolver::new(self.store.clone()))
        }

        fn webhook_consumer(&self, config: ConsumerConfig) -> TopicConsumer<WebhookRouting> {
            TopicConsumer::new(
                WebhookRouting::new(self.resolver()),
                "events",
                Arc::new(MemorySourceFactory::new(self.source.clone())),
                self.dispatcher("webhooks"),
                config,
                self.metrics.clone(),
            )
        }

        fn email_consumer(&self, config: ConsumerConfig) -> TopicConsumer<EmailRouting> {
            TopicConsumer::new(
                EmailRouting::new(self.resolver()),
                "events",
                Arc::new(MemorySourceFactory::new(self.source.clone())),
                self.dispatcher("email-subscriptions"),
                config,
                self.metrics.clone(),
            )
        }
    }

    /// Resolves to nobody after a short pause and panics for account "poison".
    #[derive(Clone, Default)]
    struct ScriptedRouting {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RoutingStrategy for ScriptedRouting {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn recipients(&self, event: &Event) -> Result<Vec<Recipient>, ResolutionError> {
            if event.account_id.as_str() == "poison" {
                panic!("routing failed for {}", event.account_id.as_str());
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    impl Harness {
        fn scripted_consumer(
            &self,
            routing: ScriptedRouting,
            config: ConsumerConfig,
        ) -> TopicConsumer<ScriptedRouting> {
            TopicConsumer::new(
                routing,
                "events",
                Arc::new(MemorySourceFactory::new(self.source.clone())),
                self.dispatcher("scripted"),
                config,
                self.metrics.clone(),
            )
        }

        fn consumed(&self, consumer: &str) -> u64 {
            self.metrics
                .messages_consumed
                .with_label_values(&[consumer])
                .get()
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {}", what);
    }

    #[tokio::test]
    async fn test_single_webhook_scenario() {
        let server = MockServer::start().await;
        Mock::given(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/hook", server.uri())));
        let mut consumer = harness.webhook_consumer(test_config());

        consumer.start().await.unwrap();
        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("commit", || harness.source.committed_offset() == Some(position.offset)).await;

        let report = consumer.shutdown().await.unwrap();
        assert_eq!(report, ShutdownReport::default());
        assert!(harness.email.sent().is_empty());
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_transient_failures_still_commit() {
        let server = MockServer::start().await;
        Mock::given(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/flaky", server.uri())));
        let mut consumer = harness.webhook_consumer(test_config());

        consumer.start().await.unwrap();
        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("commit", || harness.source.committed_offset() == Some(position.offset)).await;

        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped_and_committed() {
        let server = MockServer::start().await;
        Mock::given(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/hook", server.uri())));
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        let poison = harness.source.push(b"{not json");
        let valid = harness.source.push_json(envelope("acc1", "deploy.completed"));

        eventually("valid message committed", || {
            harness.source.committed_offset() == Some(valid.offset)
        })
        .await;
        assert!(harness.source.commits().iter().any(|p| p.offset == poison.offset));

        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_recipients_commit_without_dispatch() {
        let harness = Harness::new();
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("commit", || harness.source.committed_offset() == Some(position.offset)).await;

        consumer.shutdown().await.unwrap();
        assert_eq!(
            harness
                .metrics
                .deliveries
                .with_label_values(&["webhooks", "webhook", "delivered"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_no_commit_while_dispatch_pending() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/slow", server.uri())));
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.source.committed_offset(), None);

        eventually("commit", || harness.source.committed_offset() == Some(position.offset)).await;
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commits_stay_in_offset_order() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;
        Mock::given(path("/fast"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("slow-acc", &format!("{}/slow", server.uri())));
        harness
            .store
            .add_endpoint(webhook("fast-acc", &format!("{}/fast", server.uri())));
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        harness.source.push_json(envelope("slow-acc", "deploy.completed"));
        let second = harness.source.push_json(envelope("fast-acc", "deploy.completed"));

        // The fast message finishes first but cannot be committed past the slow one
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(harness.source.commits().is_empty());

        eventually("both committed", || {
            harness.source.committed_offset() == Some(second.offset)
        })
        .await;
        let offsets: Vec<i64> = harness.source.commits().iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![second.offset]);

        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_completes_in_flight_within_grace() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/slow", server.uri())));
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = consumer.shutdown().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.abandoned, 0);
        assert_eq!(harness.source.committed_offset(), Some(position.offset));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_after_grace_without_commit() {
        let server = MockServer::start().await;
        Mock::given(path("/stuck"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/stuck", server.uri())));
        let mut config = test_config();
        config.shutdown_grace = Duration::from_millis(100);
        let mut consumer = harness.webhook_consumer(config);
        consumer.start().await.unwrap();

        harness.source.push_json(envelope("acc1", "deploy.completed"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = consumer.shutdown().await.unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(report.abandoned, 1);
        assert!(harness.source.commits().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions_are_checked() {
        let harness = Harness::new();
        let mut consumer = harness.webhook_consumer(test_config());

        assert!(matches!(
            consumer.shutdown().await,
            Err(ConsumerLifecycleError::NotRunning { .. })
        ));

        consumer.start().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert!(matches!(
            consumer.start().await,
            Err(ConsumerLifecycleError::AlreadyStarted {
                state: ConsumerState::Running,
                ..
            })
        ));
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.shutdown().await.unwrap();
        // Restartable after a clean stop
        consumer.start().await.unwrap();
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_outage_retries_until_recovery() {
        let server = MockServer::start().await;
        Mock::given(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/hook", server.uri())));
        harness.store.set_unavailable(true);
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("several failed lookups", || harness.store.query_count() >= 3).await;
        assert_eq!(harness.source.committed_offset(), None);

        harness.store.set_unavailable(false);
        eventually("commit after recovery", || {
            harness.source.committed_offset() == Some(position.offset)
        })
        .await;

        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_resolution_retries() {
        let harness = Harness::new();
        harness.store.set_unavailable(true);
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        harness.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("a failed lookup", || harness.store.query_count() >= 1).await;

        let report = consumer.shutdown().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(harness.source.commits().is_empty());
    }

    #[tokio::test]
    async fn test_consecutive_source_errors_halt_the_loop() {
        let harness = Harness::new();
        let mut consumer = harness.webhook_consumer(test_config());
        consumer.start().await.unwrap();

        for _ in 0..3 {
            harness.source.push_error(SourceError::Closed);
        }
        eventually("loop halted", || consumer.has_halted()).await;

        assert!(matches!(
            consumer.shutdown().await,
            Err(ConsumerLifecycleError::Halted { .. })
        ));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_email_consumer_uses_subscriptions_only() {
        let server = MockServer::start().await;
        Mock::given(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let harness = Harness::new();
        harness
            .store
            .add_endpoint(webhook("acc1", &format!("{}/hook", server.uri())));
        harness
            .store
            .add_subscription(subscription("acc1", "alice", "deploy.completed"));
        harness
            .store
            .add_subscription(subscription("acc1", "bob", "deploy.failed"));
        let mut consumer = harness.email_consumer(test_config());
        consumer.start().await.unwrap();

        let position = harness.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("commit", || harness.source.committed_offset() == Some(position.offset)).await;
        consumer.shutdown().await.unwrap();

        let sent = harness.email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "alice");
        assert_eq!(sent[0].payload["build"], 7);
    }

    #[tokio::test]
    async fn test_consumers_have_independent_lifecycles() {
        let webhooks = Harness::new();
        let emails = Harness::new();
        let mut webhook_consumer = webhooks.webhook_consumer(test_config());
        let mut email_consumer = emails.email_consumer(test_config());

        webhook_consumer.start().await.unwrap();
        email_consumer.start().await.unwrap();

        for _ in 0..3 {
            webhooks.source.push_error(SourceError::Closed);
        }
        eventually("webhook loop halted", || webhook_consumer.has_halted()).await;

        let position = emails.source.push_json(envelope("acc1", "deploy.completed"));
        eventually("email consumer still commits", || {
            emails.source.committed_offset() == Some(position.offset)
        })
        .await;

        assert!(webhook_consumer.shutdown().await.is_err());
        email_consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_messages_stay_under_cap() {
        let harness = Harness::new();
        let routing = ScriptedRouting::default();
        let mut config = test_config();
        config.max_in_flight_messages = 3;
        let mut consumer = harness.scripted_consumer(routing.clone(), config);
        consumer.start().await.unwrap();

        let mut last = None;
        for _ in 0..10 {
            last = Some(harness.source.push_json(envelope("acc1", "deploy.completed")));
        }
        let last = last.unwrap();
        eventually("all committed", || harness.source.committed_offset() == Some(last.offset)).await;

        let peak = routing.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {} above cap", peak);
        assert!(peak > 1, "messages were not processed concurrently");
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicked_message_bounds_uncommitted_backlog() {
        let harness = Harness::new();
        let mut config = test_config();
        config.max_in_flight_messages = 4;
        let mut consumer = harness.scripted_consumer(ScriptedRouting::default(), config);
        consumer.start().await.unwrap();

        harness.source.push_json(envelope("poison", "deploy.completed"));
        for _ in 0..20 {
            harness.source.push_json(envelope("acc1", "deploy.completed"));
        }

        eventually("backlog filled", || harness.consumed("scripted") == 4).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nothing commits past the panicked offset and intake stops at the cap
        assert_eq!(harness.consumed("scripted"), 4);
        assert!(harness.source.commits().is_empty());

        let report = consumer.shutdown().await.unwrap();
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_shutdown_is_served_during_source_backoff() {
        let harness = Harness::new();
        let mut config = test_config();
        config.max_consecutive_source_errors = 10;
        let mut consumer = harness.webhook_consumer(config);
        consumer.start().await.unwrap();

        // The fourth error is read at ~700ms and backs off another 800ms
        for _ in 0..4 {
            harness.source.push_error(SourceError::Closed);
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        let started = std::time::Instant::now();
        consumer.shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
