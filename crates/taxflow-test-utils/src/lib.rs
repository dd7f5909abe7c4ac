//! Mocks and fixtures shared by the Taxflow test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use taxflow_core::definition::{
    Action, ActionKind, NotificationConfig, Role, Stage, StageKind, WorkflowDefinition,
};
use taxflow_core::execution::StageCounters;
use taxflow_core::traits::{ActionExecutor, Notifier};
use taxflow_core::{ActionContext, ActionOutput, HandoffContext, Notification, Result, TaxflowError};

/// Failure an action can be scripted to return.
#[derive(Debug, Clone)]
pub enum ScriptedError {
    Failed(String),
    Validation(String),
    HandlerMissing,
}

impl ScriptedError {
    fn into_error(self, action: &Action) -> TaxflowError {
        match self {
            Self::Failed(message) => TaxflowError::ActionFailed {
                action: action.id.clone(),
                message,
            },
            Self::Validation(message) => TaxflowError::ValidationFailed(message),
            Self::HandlerMissing => TaxflowError::HandlerNotFound(action.kind.name().to_string()),
        }
    }
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct ActionCall {
    pub action_id: String,
    pub stage_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub inputs: HandoffContext,
}

/// Action executor whose behavior is scripted per action id.
///
/// Unscripted actions succeed immediately with a `null` payload. Scripted
/// failures are consumed in order; once a script runs out the action
/// succeeds, unless it was set to always fail.
#[derive(Default)]
pub struct ScriptedActionExecutor {
    failures: Mutex<HashMap<String, VecDeque<ScriptedError>>>,
    always_fail: HashMap<String, String>,
    payloads: HashMap<String, serde_json::Value>,
    counters: HashMap<String, StageCounters>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<ActionCall>>,
}

impl ScriptedActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, action_id: &str, payload: serde_json::Value) -> Self {
        self.payloads.insert(action_id.to_string(), payload);
        self
    }

    pub fn with_counters(mut self, action_id: &str, counters: StageCounters) -> Self {
        self.counters.insert(action_id.to_string(), counters);
        self
    }

    pub fn with_delay(mut self, action_id: &str, delay: Duration) -> Self {
        self.delays.insert(action_id.to_string(), delay);
        self
    }

    pub fn always_fail(mut self, action_id: &str, message: &str) -> Self {
        self.always_fail.insert(action_id.to_string(), message.to_string());
        self
    }

    /// Fail the first `n` calls, then succeed.
    pub fn fail_times(self, action_id: &str, n: usize, message: &str) -> Self {
        let errors = (0..n).map(|_| ScriptedError::Failed(message.to_string())).collect();
        self.fail_with(action_id, errors)
    }

    pub fn fail_with(self, action_id: &str, errors: Vec<ScriptedError>) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures
                .entry(action_id.to_string())
                .or_default()
                .extend(errors);
        }
        self
    }

    pub fn calls(&self) -> Vec<ActionCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, action_id: &str) -> usize {
        self.calls().iter().filter(|c| c.action_id == action_id).count()
    }

    fn next_failure(&self, action_id: &str) -> Option<ScriptedError> {
        if let Some(message) = self.always_fail.get(action_id) {
            return Some(ScriptedError::Failed(message.clone()));
        }
        self.failures
            .lock()
            .ok()
            .and_then(|mut f| f.get_mut(action_id).and_then(|q| q.pop_front()))
    }
}

impl ActionExecutor for ScriptedActionExecutor {
    fn execute(&self, action: Action, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(ActionCall {
                    action_id: action.id.clone(),
                    stage_id: ctx.stage_id.clone(),
                    attempt: ctx.attempt,
                    started_at: Utc::now(),
                    inputs: ctx.inputs.clone(),
                });
            }

            if let Some(delay) = self.delays.get(&action.id) {
                tokio::time::sleep(*delay).await;
            }

            if let Some(err) = self.next_failure(&action.id) {
                return Err(err.into_error(&action));
            }

            let payload = self
                .payloads
                .get(&action.id)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let counters = self.counters.get(&action.id).copied().unwrap_or_default();
            Ok(ActionOutput::new(payload).with_counters(counters))
        })
    }
}

/// Notifier that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationConfig, Notification)>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose deliveries always fail (still recorded).
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(vec![]),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(NotificationConfig, Notification)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, config: NotificationConfig, payload: Notification) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let channel = config.channel.clone();
            if let Ok(mut sent) = self.sent.lock() {
                sent.push((config, payload));
            }
            if self.fail {
                return Err(TaxflowError::Notification {
                    channel,
                    message: "delivery refused".into(),
                });
            }
            Ok(())
        })
    }
}

/// A data-transform action with the given id.
pub fn work_action(id: &str) -> Action {
    Action::new(
        id,
        ActionKind::DataTransform {
            mapping: format!("{}-mapping", id),
        },
    )
}

/// A stage with one `{id}-work` action and a single permission.
pub fn simple_stage(id: &str) -> Stage {
    Stage::new(id, id, StageKind::Custom, Role::SystemIntegration)
        .with_permissions(vec!["workflow.run".into()])
        .with_expected_duration(1)
        .with_action(work_action(&format!("{}-work", id)))
}

/// `ids[0] -> ids[1] -> ...`, each built with [`simple_stage`].
pub fn linear_chain(ids: &[&str]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new("chain", "Linear chain");
    for (i, id) in ids.iter().enumerate() {
        let mut stage = simple_stage(id);
        if i > 0 {
            stage = stage.depends_on(&[ids[i - 1]]);
        }
        def = def.with_stage(stage);
    }
    def
}

/// One root stage fanning out to `branches` independent stages.
pub fn fan_out(root: &str, branches: &[&str]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new("fan-out", "Fan out").with_stage(simple_stage(root));
    for id in branches {
        def = def.with_stage(simple_stage(id).depends_on(&[root]));
    }
    def
}
