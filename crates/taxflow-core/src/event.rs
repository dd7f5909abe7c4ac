use serde::{Deserialize, Serialize};

use crate::definition::Role;
use crate::error::ErrorKind;
use crate::execution::{ExecutionId, ExecutionStatus, Severity, SkipReason, SlaStatus};

/// State-transition event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    StageStarted {
        execution_id: ExecutionId,
        stage_id: String,
        attempt: u32,
    },
    StageCompleted {
        execution_id: ExecutionId,
        stage_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    StageFailed {
        execution_id: ExecutionId,
        stage_id: String,
        attempt: u32,
        kind: ErrorKind,
        error: String,
    },
    StageRetryScheduled {
        execution_id: ExecutionId,
        stage_id: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    StageSkipped {
        execution_id: ExecutionId,
        stage_id: String,
        reason: SkipReason,
    },
    StageEscalated {
        execution_id: ExecutionId,
        stage_id: String,
        roles: Vec<Role>,
    },
    RollbackCompleted {
        execution_id: ExecutionId,
        failed_stage: String,
        compensated: Vec<String>,
    },
    BottleneckDetected {
        execution_id: ExecutionId,
        stage_id: String,
        delay_percentage: f64,
        severity: Severity,
    },
    SlaStatusChanged {
        execution_id: ExecutionId,
        from: SlaStatus,
        to: SlaStatus,
    },
    ExecutionPaused { execution_id: ExecutionId },
    ExecutionResumed { execution_id: ExecutionId },
    ExecutionCancelled { execution_id: ExecutionId },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        performance_score: f64,
    },
    TriggerFired {
        workflow_id: String,
        trigger_id: String,
    },
}

impl WorkflowEvent {
    /// The execution this event belongs to, if any.
    pub fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StageStarted { execution_id, .. }
            | Self::StageCompleted { execution_id, .. }
            | Self::StageFailed { execution_id, .. }
            | Self::StageRetryScheduled { execution_id, .. }
            | Self::StageSkipped { execution_id, .. }
            | Self::StageEscalated { execution_id, .. }
            | Self::RollbackCompleted { execution_id, .. }
            | Self::BottleneckDetected { execution_id, .. }
            | Self::SlaStatusChanged { execution_id, .. }
            | Self::ExecutionPaused { execution_id }
            | Self::ExecutionResumed { execution_id }
            | Self::ExecutionCancelled { execution_id }
            | Self::ExecutionFinished { execution_id, .. } => Some(execution_id),
            Self::TriggerFired { .. } => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
