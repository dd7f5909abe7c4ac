use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use taxflow_core::config::SimulationConfig;
use taxflow_core::definition::{Action, ActionKind, NotificationConfig};
use taxflow_core::execution::StageCounters;
use taxflow_core::traits::{ActionExecutor, Notifier};
use taxflow_core::{ActionContext, ActionOutput, Notification, Result, TaxflowError};

/// Stands in for real integrations when running definitions from the CLI.
/// Every action sleeps a jittered latency and fails with the configured
/// probability.
pub struct SimulatedActionExecutor {
    config: SimulationConfig,
}

impl SimulatedActionExecutor {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn roll(&self) -> (Duration, bool, u64) {
        let mut rng = rand::thread_rng();
        let base = self.config.latency_ms;
        let latency = rng.gen_range(base / 2..=base.saturating_add(base / 2));
        // Non-finite rates never fail
        let rate = self.config.failure_rate;
        let fails = rate.is_finite() && rng.gen_bool(rate.clamp(0.0, 1.0));
        let docs = self.config.documents_per_action;
        // Up to 10% of documents come back rejected
        let rejected = if docs > 0 { rng.gen_range(0..=docs / 10) } else { 0 };
        (Duration::from_millis(latency), fails, rejected)
    }

    fn counters(&self, kind: &ActionKind, rejected: u64) -> StageCounters {
        let docs = self.config.documents_per_action;
        match kind {
            ActionKind::RemoteCall { .. } => StageCounters {
                documents_processed: docs,
                documents_succeeded: docs - rejected,
                documents_failed: rejected,
                data_volume_bytes: docs.saturating_mul(4096),
                external_calls: 1,
                cache_hits: 0,
            },
            ActionKind::DataTransform { .. } | ActionKind::Validation { .. } => StageCounters {
                documents_processed: docs,
                documents_succeeded: docs - rejected,
                documents_failed: rejected,
                data_volume_bytes: docs.saturating_mul(1024),
                ..Default::default()
            },
            ActionKind::Notification { .. } | ActionKind::ManualReview { .. } => {
                StageCounters::default()
            }
        }
    }
}

impl ActionExecutor for SimulatedActionExecutor {
    fn execute(&self, action: Action, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move {
            let (latency, fails, rejected) = self.roll();
            debug!(
                stage_id = %ctx.stage_id,
                action = %action.id,
                kind = action.kind.name(),
                latency_ms = latency.as_millis() as u64,
                "Simulating action"
            );
            tokio::time::sleep(latency).await;

            if fails {
                return Err(match action.kind {
                    ActionKind::Validation { rule_set } => {
                        TaxflowError::ValidationFailed(format!("rule set '{}' rejected the batch", rule_set))
                    }
                    _ => TaxflowError::ActionFailed {
                        action: action.id.clone(),
                        message: "simulated failure".to_string(),
                    },
                });
            }

            let payload = match &action.kind {
                ActionKind::RemoteCall { endpoint, method } => json!({
                    "endpoint": endpoint,
                    "method": method,
                    "status": 200,
                }),
                ActionKind::ManualReview { reviewer, .. } => json!({
                    "reviewer": reviewer.to_string(),
                    "approved": true,
                }),
                kind => json!({ "kind": kind.name(), "attempt": ctx.attempt }),
            };
            Ok(ActionOutput::new(payload).with_counters(self.counters(&action.kind, rejected)))
        })
    }
}

/// Delivers escalations to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, config: NotificationConfig, payload: Notification) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let roles: Vec<String> = payload.roles.iter().map(|r| r.to_string()).collect();
            warn!(
                channel = %config.channel,
                execution_id = %payload.execution_id,
                stage_id = %payload.stage_id,
                roles = %roles.join(","),
                kind = ?payload.kind,
                "Escalation: {}",
                payload.message
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxflow_core::execution::ExecutionId;
    use taxflow_core::HandoffContext;

    fn ctx() -> ActionContext {
        ActionContext {
            execution_id: ExecutionId::from_string("e1"),
            workflow_id: "wf".into(),
            stage_id: "submit".into(),
            attempt: 1,
            inputs: HandoffContext::new(),
        }
    }

    fn remote() -> Action {
        Action::new(
            "submit-return",
            ActionKind::RemoteCall {
                endpoint: "https://tax.example/returns".into(),
                method: "POST".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_remote_call_counts_documents() {
        let exec = SimulatedActionExecutor::new(SimulationConfig {
            latency_ms: 0,
            failure_rate: 0.0,
            documents_per_action: 20,
        });
        let out = exec.execute(remote(), ctx()).await.unwrap();
        assert_eq!(out.payload["status"], 200);
        assert_eq!(out.counters.external_calls, 1);
        assert_eq!(out.counters.documents_processed, 20);
        assert_eq!(
            out.counters.documents_succeeded + out.counters.documents_failed,
            20
        );
        assert!(out.counters.documents_failed <= 2);
    }

    #[tokio::test]
    async fn test_failure_rate_one_always_fails() {
        let exec = SimulatedActionExecutor::new(SimulationConfig {
            latency_ms: 0,
            failure_rate: 1.0,
            documents_per_action: 5,
        });
        let err = exec.execute(remote(), ctx()).await.unwrap_err();
        assert!(matches!(err, TaxflowError::ActionFailed { .. }));

        let validation = Action::new(
            "check",
            ActionKind::Validation {
                rule_set: "vat".into(),
            },
        );
        let err = exec.execute(validation, ctx()).await.unwrap_err();
        assert!(matches!(err, TaxflowError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_failure_rate_does_not_panic() {
        for (rate, should_fail) in [(f64::NAN, false), (f64::INFINITY, false), (-3.0, false), (7.5, true)] {
            let exec = SimulatedActionExecutor::new(SimulationConfig {
                latency_ms: 0,
                failure_rate: rate,
                documents_per_action: 1,
            });
            let result = exec.execute(remote(), ctx()).await;
            assert_eq!(result.is_err(), should_fail, "failure_rate {}", rate);
        }
    }
}
