use chrono::Utc;
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::{Actor, Reply};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{ComponentHealth, HealthStatus};
use crate::messaging::RedpandaClient;
use crate::utils::CircuitState;

// ============================================================================
// Health Monitor Actor
// ============================================================================
//
// Components (the two consumers, the dead-letter producer) push their status
// here; the `/health` endpoint asks for the aggregate.
//
// ============================================================================

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct GetSystemHealth;

#[derive(Debug, Clone, Serialize, Reply)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: chrono::DateTime<Utc>,
}

// ============================================================================
// Health Monitor Actor
// ============================================================================

pub struct HealthMonitorActor {
    components: HashMap<String, ComponentHealth>,
    dead_letters: Option<Arc<RedpandaClient>>,
}

impl HealthMonitorActor {
    pub fn new(dead_letters: Option<Arc<RedpandaClient>>) -> Self {
        Self {
            components: HashMap::new(),
            dead_letters,
        }
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut degraded = Vec::new();
        let mut unhealthy = Vec::new();

        for (name, health) in &self.components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => unhealthy.push(format!("{}: {}", name, msg)),
                HealthStatus::Degraded(msg) => degraded.push(format!("{}: {}", name, msg)),
                HealthStatus::Healthy => {}
            }
        }

        // Stable output regardless of map order
        unhealthy.sort();
        degraded.sort();

        if !unhealthy.is_empty() {
            HealthStatus::Unhealthy(unhealthy.join(", "))
        } else if !degraded.is_empty() {
            HealthStatus::Degraded(degraded.join(", "))
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Actor for HealthMonitorActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("HealthMonitorActor started");

        if let Some(producer) = state.dead_letters.clone() {
            let monitor = actor_ref.downgrade();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(10));
                loop {
                    interval.tick().await;

                    let Some(monitor) = monitor.upgrade() else {
                        break;
                    };

                    let status = match producer.circuit_state() {
                        CircuitState::Closed => HealthStatus::Healthy,
                        CircuitState::HalfOpen => {
                            HealthStatus::Degraded("Circuit breaker half-open".to_string())
                        }
                        CircuitState::Open => {
                            HealthStatus::Degraded("Circuit breaker open".to_string())
                        }
                    };

                    // Fire and forget - use tell
                    let _ = monitor
                        .tell(UpdateHealth {
                            component: "dead_letter_producer".to_string(),
                            status,
                            details: None,
                        })
                        .send()
                        .await;
                }
            });
        }

        Ok(state)
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<UpdateHealth> for HealthMonitorActor {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: UpdateHealth,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let changed = self
            .components
            .get(&msg.component)
            .map(|previous| previous.status != msg.status)
            .unwrap_or(true);

        if changed {
            tracing::info!(
                component = %msg.component,
                status = ?msg.status,
                "Component health changed"
            );
        }

        let health = ComponentHealth::new(msg.component.clone(), msg.status).with_details(msg.details);
        self.components.insert(msg.component, health);
    }
}

impl Message<GetSystemHealth> for HealthMonitorActor {
    type Reply = SystemHealth;

    async fn handle(
        &mut self,
        _msg: GetSystemHealth,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        SystemHealth {
            overall_status: self.compute_overall_status(),
            components: self.components.clone(),
            check_time: Utc::now(),
        }
    }
}

// ============================================================================
// Reporter handle
// ============================================================================

/// Cheap handle components use to push status; a no-op when no monitor runs.
#[derive(Clone, Default)]
pub struct HealthReporter {
    monitor: Option<ActorRef<HealthMonitorActor>>,
}

impl HealthReporter {
    pub fn new(monitor: ActorRef<HealthMonitorActor>) -> Self {
        Self {
            monitor: Some(monitor),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn report(&self, component: &str, status: HealthStatus, details: Option<String>) {
        if let Some(monitor) = &self.monitor {
            let sent = monitor
                .tell(UpdateHealth {
                    component: component.to_string(),
                    status,
                    details,
                })
                .send()
                .await;
            if sent.is_err() {
                tracing::debug!(component = %component, "Health monitor unavailable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new(None));
        let reporter = HealthReporter::new(monitor.clone());

        reporter.report("webhooks", HealthStatus::Healthy, None).await;
        reporter
            .report("email-subscriptions", HealthStatus::Degraded("store slow".into()), None)
            .await;
        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(matches!(health.overall_status, HealthStatus::Degraded(_)));
        assert_eq!(health.components.len(), 2);

        reporter
            .report("webhooks", HealthStatus::Unhealthy("source down".into()), None)
            .await;
        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert_eq!(
            health.overall_status,
            HealthStatus::Unhealthy("webhooks: source down".to_string())
        );
    }

    #[tokio::test]
    async fn test_disabled_reporter_is_a_no_op() {
        HealthReporter::disabled()
            .report("webhooks", HealthStatus::Healthy, None)
            .await;
    }
}
