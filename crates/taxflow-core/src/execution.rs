//! Execution state: one `WorkflowExecution` per run, one `StageExecution`
//! per stage, plus derived metrics, bottlenecks, and SLA status.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{StageKind, WorkflowDefinition};
use crate::error::ErrorKind;
use crate::handoff::HandoffContext;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    /// Whether the stage-level state machine allows `self -> next`.
    ///
    /// `Failed -> Running` is only taken through the retry path and
    /// `Running -> Skipped` only by a `skip` error-handling rule.
    pub fn can_transition(&self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
                | (Failed, Running)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Skipped by an error-handling rule.
    Policy,
    /// An upstream dependency failed or was skipped on a strict edge.
    UpstreamFailed,
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Policy => "policy",
            Self::UpstreamFailed => "upstream_failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Outcome of one action invocation within an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub status: ActionStatus,
    pub required: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A stage failure, classified against the error taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Fatal failures bypass retry policy.
    #[serde(default)]
    pub fatal: bool,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fatal: true,
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One attempt at running a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
}

/// Per-stage output counters, summed into `ExecutionMetrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub documents_processed: u64,
    pub documents_succeeded: u64,
    pub documents_failed: u64,
    pub data_volume_bytes: u64,
    pub external_calls: u64,
    pub cache_hits: u64,
}

impl StageCounters {
    pub fn merge(&mut self, other: &StageCounters) {
        self.documents_processed += other.documents_processed;
        self.documents_succeeded += other.documents_succeeded;
        self.documents_failed += other.documents_failed;
        self.data_volume_bytes += other.data_volume_bytes;
        self.external_calls += other.external_calls;
        self.cache_hits += other.cache_hits;
    }
}

/// Execution state of a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_id: String,
    pub state: StageState,
    /// When the stage became ready and entered the dispatch queue.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    /// First dispatch time.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// From first dispatch to the terminal transition, retries included.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<StageFailure>,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
    /// Stages in flight (this one included) at the latest dispatch.
    #[serde(default)]
    pub in_flight_at_dispatch: usize,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub counters: StageCounters,
    #[serde(default)]
    pub output: HandoffContext,
    /// Compensating actions ran for this stage during a rollback.
    #[serde(default)]
    pub compensated: bool,
}

impl StageExecution {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            state: StageState::Pending,
            queued_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
            last_error: None,
            skip_reason: None,
            in_flight_at_dispatch: 0,
            attempts: vec![],
            counters: StageCounters::default(),
            output: HandoffContext::new(),
            compensated: false,
        }
    }

    /// Apply a state transition, rejecting ones the state machine forbids.
    pub fn transition(&mut self, next: StageState) -> std::result::Result<(), String> {
        if !self.state.can_transition(next) {
            return Err(format!(
                "Invalid stage transition for {}: {} -> {}",
                self.stage_id, self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }
}

/// Rolled-up execution metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub documents_processed: u64,
    pub documents_succeeded: u64,
    pub documents_failed: u64,
    pub data_volume_bytes: u64,
    pub external_calls: u64,
    pub cache_hits: u64,
    pub stages_completed: usize,
    pub stages_failed: usize,
    pub stages_skipped: usize,
    pub total_retries: u32,
    /// Weighted score in [0, 100].
    pub performance_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTrack,
    AtRisk,
    Breached,
}

impl std::fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OnTrack => "on_track",
            Self::AtRisk => "at_risk",
            Self::Breached => "breached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A stage that took significantly longer than expected. Derived, never stored
/// as primary state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub stage_id: String,
    pub stage_kind: StageKind,
    pub expected_secs: f64,
    pub actual_secs: f64,
    pub delay_percentage: f64,
    pub severity: Severity,
    pub root_causes: Vec<String>,
    pub recommended_actions: Vec<String>,
}

/// A single run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Stage executions in definition order.
    pub stages: Vec<StageExecution>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub bottlenecks: Vec<Bottleneck>,
    pub sla_status: SlaStatus,
}

impl WorkflowExecution {
    /// Create a running execution with one pending stage record per stage.
    pub fn new(definition: &WorkflowDefinition, deadline_secs: Option<u64>) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            deadline_secs,
            stages: definition
                .stages
                .iter()
                .map(|s| StageExecution::new(s.id.clone()))
                .collect(),
            metrics: ExecutionMetrics::default(),
            bottlenecks: vec![],
            sla_status: SlaStatus::OnTrack,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_id == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.stage_id == id)
    }

    /// Absolute deadline. A deadline past the representable date range is
    /// treated as no deadline at all.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
            .and_then(|d| self.started_at.checked_add_signed(d))
    }

    /// Whether every stage has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.stages.iter().all(|s| s.state.is_terminal())
    }
}

/// Point-in-time view for dashboards and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub stage_states: Vec<StageStateView>,
    pub metrics: ExecutionMetrics,
    pub bottlenecks: Vec<Bottleneck>,
    pub sla_status: SlaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStateView {
    pub stage_id: String,
    pub state: StageState,
    pub retry_count: u32,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl From<&WorkflowExecution> for ExecutionSnapshot {
    fn from(exec: &WorkflowExecution) -> Self {
        Self {
            execution_id: exec.id.clone(),
            workflow_id: exec.workflow_id.clone(),
            status: exec.status,
            stage_states: exec
                .stages
                .iter()
                .map(|s| StageStateView {
                    stage_id: s.stage_id.clone(),
                    state: s.state,
                    retry_count: s.retry_count,
                    skip_reason: s.skip_reason,
                    last_error: s.last_error.as_ref().map(|e| e.to_string()),
                })
                .collect(),
            metrics: exec.metrics.clone(),
            bottlenecks: exec.bottlenecks.clone(),
            sla_status: exec.sla_status,
        }
    }
}
