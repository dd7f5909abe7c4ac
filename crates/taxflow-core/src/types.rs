use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::definition::Role;
use crate::error::ErrorKind;
use crate::execution::{ExecutionId, StageCounters};
use crate::handoff::HandoffContext;

/// Context passed to action executors.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub stage_id: String,
    /// 1-based attempt number of the stage.
    pub attempt: u32,
    /// Initial data plus outputs of completed predecessors.
    pub inputs: HandoffContext,
}

/// Result of a successful action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub counters: StageCounters,
}

impl ActionOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            counters: StageCounters::default(),
        }
    }

    pub fn with_counters(mut self, counters: StageCounters) -> Self {
        self.counters = counters;
        self
    }
}

/// Escalation or notification payload handed to a `Notifier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub stage_id: String,
    pub roles: Vec<Role>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Options for starting an execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Overrides the definition's deadline.
    pub deadline_secs: Option<u64>,
    /// When set, stages requiring permissions outside this set fail with
    /// `permission_denied`.
    pub granted_permissions: Option<HashSet<String>>,
    pub initial_context: HandoffContext,
}

impl ExecutionOptions {
    pub fn with_deadline(mut self, secs: u64) -> Self {
        self.deadline_secs = Some(secs);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.granted_permissions = Some(permissions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_context(mut self, context: HandoffContext) -> Self {
        self.initial_context = context;
        self
    }
}
