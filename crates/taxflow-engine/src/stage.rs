//! Runs one attempt of a stage: its ordered actions, each under a timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use taxflow_core::definition::Stage;
use taxflow_core::execution::{
    ActionRecord, ActionStatus, AttemptRecord, StageCounters, StageFailure,
};
use taxflow_core::traits::ActionExecutor;
use taxflow_core::{ActionContext, ErrorKind, HandoffContext};

/// Result of a single stage attempt.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub record: AttemptRecord,
    /// Merged payloads of the successful actions.
    pub output: HandoffContext,
    pub counters: StageCounters,
    /// The required action that failed the attempt, if any.
    pub failed_action: Option<String>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.failure.is_none()
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.record.failure.as_ref()
    }

    /// An attempt that never ran its actions.
    pub fn aborted(attempt: u32, failure: StageFailure) -> Self {
        let now = Utc::now();
        Self {
            record: AttemptRecord {
                attempt,
                started_at: now,
                finished_at: now,
                actions: vec![],
                failure: Some(failure),
            },
            output: HandoffContext::new(),
            counters: StageCounters::default(),
            failed_action: None,
        }
    }
}

struct ActionRun {
    output: HandoffContext,
    counters: StageCounters,
    records: Vec<ActionRecord>,
    /// The action in flight, cleared once its record is pushed.
    current: Option<(String, bool, Instant)>,
}

#[derive(Clone)]
pub struct StageExecutor {
    actions: Arc<dyn ActionExecutor>,
}

impl StageExecutor {
    pub fn new(actions: Arc<dyn ActionExecutor>) -> Self {
        Self { actions }
    }

    /// Run `stage` once. `ctx.attempt` is the 1-based attempt number.
    pub async fn execute(
        &self,
        stage: &Stage,
        ctx: ActionContext,
        granted: Option<&HashSet<String>>,
    ) -> StageOutcome {
        let attempt = ctx.attempt;

        if let Some(granted) = granted {
            let missing: Vec<&str> = stage
                .permissions
                .iter()
                .filter(|p| !granted.contains(*p))
                .map(|p| p.as_str())
                .collect();
            if !missing.is_empty() {
                warn!(stage_id = %stage.id, ?missing, "Stage permissions not granted");
                return StageOutcome::aborted(
                    attempt,
                    StageFailure::new(
                        ErrorKind::PermissionDenied,
                        format!("missing permissions: {}", missing.join(", ")),
                    ),
                );
            }
        }

        let started_at = Utc::now();
        let mut run = ActionRun {
            output: HandoffContext::new(),
            counters: StageCounters::default(),
            records: Vec::new(),
            current: None,
        };

        let result = match stage.timeout_secs {
            Some(secs) => {
                let bounded = tokio::time::timeout(
                    Duration::from_secs(secs),
                    self.run_actions(stage, &ctx, &mut run),
                )
                .await;
                match bounded {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(stage_id = %stage.id, timeout_secs = secs, "Stage timed out");
                        let message = format!("stage exceeded {}s", secs);
                        let aborted = run.current.take().map(|(action_id, required, started)| {
                            run.records.push(ActionRecord {
                                action_id: action_id.clone(),
                                status: ActionStatus::TimedOut,
                                required,
                                error: Some(message.clone()),
                                duration_ms: started.elapsed().as_millis() as u64,
                            });
                            action_id
                        });
                        Err((aborted, StageFailure::new(ErrorKind::ActionTimeout, message)))
                    }
                }
            }
            None => self.run_actions(stage, &ctx, &mut run).await,
        };

        let (failed_action, failure) = match result {
            Ok(()) => (None, None),
            Err((action, failure)) => (action, Some(failure)),
        };

        StageOutcome {
            record: AttemptRecord {
                attempt,
                started_at,
                finished_at: Utc::now(),
                actions: run.records,
                failure,
            },
            output: run.output,
            counters: run.counters,
            failed_action,
        }
    }

    async fn run_actions(
        &self,
        stage: &Stage,
        ctx: &ActionContext,
        run: &mut ActionRun,
    ) -> std::result::Result<(), (Option<String>, StageFailure)> {
        for action in &stage.actions {
            let started = Instant::now();
            run.current = Some((action.id.clone(), action.required, started));
            let result = tokio::time::timeout(
                Duration::from_secs(action.timeout_secs),
                self.actions.execute(action.clone(), ctx.clone()),
            )
            .await;
            let duration_ms = started.elapsed().as_millis() as u64;
            run.current = None;

            let failure = match result {
                Ok(Ok(out)) => {
                    debug!(stage_id = %stage.id, action_id = %action.id, duration_ms, "Action succeeded");
                    run.output.ingest(&action.id, &out.payload);
                    run.counters.merge(&out.counters);
                    run.records.push(ActionRecord {
                        action_id: action.id.clone(),
                        status: ActionStatus::Succeeded,
                        required: action.required,
                        error: None,
                        duration_ms,
                    });
                    continue;
                }
                Ok(Err(e)) => {
                    run.records.push(ActionRecord {
                        action_id: action.id.clone(),
                        status: ActionStatus::Failed,
                        required: action.required,
                        error: Some(e.to_string()),
                        duration_ms,
                    });
                    if e.is_fatal() {
                        return Err((
                            Some(action.id.clone()),
                            StageFailure::fatal(ErrorKind::ActionFailed, e.to_string()),
                        ));
                    }
                    StageFailure::new(e.kind(), e.to_string())
                }
                Err(_) => {
                    let message = format!(
                        "action '{}' timed out after {}s",
                        action.id, action.timeout_secs
                    );
                    run.records.push(ActionRecord {
                        action_id: action.id.clone(),
                        status: ActionStatus::TimedOut,
                        required: action.required,
                        error: Some(message.clone()),
                        duration_ms,
                    });
                    StageFailure::new(ErrorKind::ActionTimeout, message)
                }
            };

            if action.required {
                warn!(
                    stage_id = %stage.id,
                    action_id = %action.id,
                    attempt = ctx.attempt,
                    error = %failure,
                    "Required action failed"
                );
                return Err((Some(action.id.clone()), failure));
            }
            warn!(
                stage_id = %stage.id,
                action_id = %action.id,
                error = %failure,
                "Optional action failed, continuing"
            );
        }
        Ok(())
    }
}
