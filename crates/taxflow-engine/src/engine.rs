//! The execution engine.
//!
//! Each execution is driven by a single scheduler task that owns the
//! `WorkflowExecution` record. Stage attempts, retry timers, rollbacks and
//! escalation deliveries run as tasks in a `JoinSet` and report back to the
//! scheduler; pause/resume/cancel arrive over an `mpsc` channel and are
//! handled before task results. The latest state is published on a `watch`
//! channel for snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use taxflow_core::config::{AppConfig, EngineConfig};
use taxflow_core::definition::{Dependency, Stage, WorkflowDefinition};
use taxflow_core::execution::{
    ExecutionId, ExecutionSnapshot, ExecutionStatus, SkipReason, StageFailure, StageState,
    WorkflowExecution,
};
use taxflow_core::traits::{ActionExecutor, Notifier};
use taxflow_core::{
    ActionContext, ErrorKind, EventBus, ExecutionOptions, HandoffContext, Notification, Result,
    TaxflowError, WorkflowEvent,
};

use crate::analyzer::BottleneckAnalyzer;
use crate::metrics::MetricsAggregator;
use crate::policy::{ErrorPolicy, PolicyDecision};
use crate::stage::{StageExecutor, StageOutcome};
use crate::validator::{GraphValidator, ValidationReport};

/// Orchestrates executions of workflow definitions.
#[derive(Clone)]
pub struct ExecutionEngine {
    config: EngineConfig,
    validator: Arc<GraphValidator>,
    stage_executor: StageExecutor,
    policy: ErrorPolicy,
    analyzer: BottleneckAnalyzer,
    aggregator: MetricsAggregator,
    actions: Arc<dyn ActionExecutor>,
    notifier: Arc<dyn Notifier>,
    event_bus: Arc<EventBus>,
}

impl ExecutionEngine {
    pub fn new(
        config: &AppConfig,
        actions: Arc<dyn ActionExecutor>,
        notifier: Arc<dyn Notifier>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config: config.engine.clone(),
            validator: Arc::new(GraphValidator::new(config.validation.clone())),
            stage_executor: StageExecutor::new(actions.clone()),
            policy: ErrorPolicy::new(config.retry.clone()),
            analyzer: BottleneckAnalyzer::new(
                config.analysis.clone(),
                config.engine.max_concurrent_stages.max(1),
            ),
            aggregator: MetricsAggregator::new(config.scoring.clone()),
            actions,
            notifier,
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        self.validator.validate(definition)
    }

    /// Validate and start an execution. Invalid definitions never produce one.
    pub fn start(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle> {
        let definition = definition.into();
        let report = self.validator.validate(&definition);
        for warning in &report.warnings {
            warn!(workflow_id = %definition.id, %warning, "Definition warning");
        }
        if !report.valid {
            error!(
                workflow_id = %definition.id,
                errors = report.errors.len(),
                "Refusing to start invalid definition"
            );
            return Err(TaxflowError::DefinitionInvalid {
                errors: report.errors,
            });
        }

        let deadline = options.deadline_secs.or(definition.deadline_secs);
        let exec = WorkflowExecution::new(&definition, deadline);
        let id = exec.id.clone();

        let (control_tx, control_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(exec.clone());

        let scheduler = Scheduler {
            engine: self.clone(),
            edges: definition.edges(),
            definition: definition.clone(),
            exec,
            options,
            control: control_rx,
            control_open: true,
            state: state_tx,
            tasks: JoinSet::new(),
            queue: VecDeque::new(),
            in_flight: 0,
            retry_timers: HashMap::new(),
            held: Vec::new(),
            cancelled: false,
        };
        let join = tokio::spawn(scheduler.run());

        Ok(ExecutionHandle {
            control: ExecutionControl {
                id: id.clone(),
                control: control_tx,
            },
            id,
            state: state_rx,
            join,
            definition,
            analyzer: self.analyzer.clone(),
        })
    }

    /// Start an execution and wait for it to finish.
    pub async fn run(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        options: ExecutionOptions,
    ) -> Result<WorkflowExecution> {
        self.start(definition, options)?.wait().await
    }
}

#[derive(Debug, Clone, Copy)]
enum ControlCommand {
    Pause,
    Resume,
    Cancel,
}

/// Cloneable control half of an `ExecutionHandle`.
#[derive(Clone)]
pub struct ExecutionControl {
    id: ExecutionId,
    control: mpsc::Sender<ControlCommand>,
}

impl ExecutionControl {
    pub async fn pause(&self) -> Result<()> {
        self.send(ControlCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(ControlCommand::Resume).await
    }

    /// Stop dispatching; in-flight stages finish, pending ones are skipped.
    pub async fn cancel(&self) -> Result<()> {
        self.send(ControlCommand::Cancel).await
    }

    async fn send(&self, cmd: ControlCommand) -> Result<()> {
        self.control
            .send(cmd)
            .await
            .map_err(|_| TaxflowError::ExecutionClosed(self.id.to_string()))
    }
}

/// Handle to a running execution.
pub struct ExecutionHandle {
    id: ExecutionId,
    control: ExecutionControl,
    state: watch::Receiver<WorkflowExecution>,
    join: JoinHandle<WorkflowExecution>,
    definition: Arc<WorkflowDefinition>,
    analyzer: BottleneckAnalyzer,
}

impl ExecutionHandle {
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub async fn pause(&self) -> Result<()> {
        self.control.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.control.resume().await
    }

    /// Stop dispatching; in-flight stages finish, pending ones are skipped.
    pub async fn cancel(&self) -> Result<()> {
        self.control.cancel().await
    }

    /// A control half that outlives `wait()`.
    pub fn control(&self) -> ExecutionControl {
        self.control.clone()
    }

    /// The latest execution record.
    pub fn execution(&self) -> WorkflowExecution {
        self.state.borrow().clone()
    }

    /// Point-in-time view with SLA status evaluated now.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let exec = self.execution();
        let mut snapshot = ExecutionSnapshot::from(&exec);
        snapshot.sla_status = self.analyzer.sla_status(&self.definition, &exec, Utc::now());
        snapshot
    }

    /// Wait for the scheduler to finish and return the final record.
    pub async fn wait(self) -> Result<WorkflowExecution> {
        let id = self.id.to_string();
        self.join
            .await
            .map_err(|e| TaxflowError::ExecutionClosed(format!("{}: {}", id, e)))
    }
}

enum TaskDone {
    Stage { stage_id: String, outcome: StageOutcome },
    RetryDue { stage_id: String },
    Rollback { failed_stage: String, compensated: Vec<String> },
    Notified,
}

enum Step {
    Control(Option<ControlCommand>),
    Task(std::result::Result<TaskDone, JoinError>),
}

enum Readiness {
    Ready,
    Blocked,
    Unsatisfiable,
}

/// Single writer of one `WorkflowExecution`.
struct Scheduler {
    engine: ExecutionEngine,
    definition: Arc<WorkflowDefinition>,
    edges: Vec<Dependency>,
    exec: WorkflowExecution,
    options: ExecutionOptions,
    control: mpsc::Receiver<ControlCommand>,
    control_open: bool,
    state: watch::Sender<WorkflowExecution>,
    tasks: JoinSet<TaskDone>,
    /// Ready stages in FIFO order of readiness.
    queue: VecDeque<String>,
    in_flight: usize,
    retry_timers: HashMap<String, AbortHandle>,
    /// Failed stages held by a `pause` rule until resume.
    held: Vec<String>,
    cancelled: bool,
}

impl Scheduler {
    async fn run(mut self) -> WorkflowExecution {
        info!(
            execution_id = %self.exec.id,
            workflow_id = %self.exec.workflow_id,
            stages = self.exec.stages.len(),
            "Execution started"
        );
        self.publish(WorkflowEvent::ExecutionStarted {
            execution_id: self.exec.id.clone(),
            workflow_id: self.exec.workflow_id.clone(),
        });
        self.schedule_ready();
        self.refresh();

        loop {
            if self.exec.status == ExecutionStatus::Running && self.dispatch_ready() {
                self.refresh();
            }
            if self.tasks.is_empty() {
                let awaiting_resume =
                    self.exec.status == ExecutionStatus::Paused && self.control_open;
                if !awaiting_resume {
                    break;
                }
            }

            let step = tokio::select! {
                biased;
                cmd = self.control.recv(), if self.control_open => Step::Control(cmd),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => Step::Task(joined),
            };

            match step {
                Step::Control(Some(cmd)) => self.handle_command(cmd),
                Step::Control(None) => {
                    self.control_open = false;
                    if self.exec.status == ExecutionStatus::Paused {
                        warn!(execution_id = %self.exec.id, "Handle dropped while paused, cancelling");
                        self.cancel();
                    }
                }
                Step::Task(Ok(done)) => self.handle_done(done),
                Step::Task(Err(e)) => {
                    if !e.is_cancelled() {
                        error!(execution_id = %self.exec.id, error = %e, "Execution task failed");
                    }
                }
            }
            self.refresh();
        }

        self.finish()
    }

    fn publish(&self, event: WorkflowEvent) {
        self.engine.event_bus.publish(event);
    }

    /// Returns whether anything was dispatched.
    fn dispatch_ready(&mut self) -> bool {
        let limit = self.engine.config.max_concurrent_stages.max(1);
        let mut dispatched = false;
        while self.in_flight < limit {
            let Some(stage_id) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(&stage_id);
            dispatched = true;
        }
        dispatched
    }

    fn dispatch(&mut self, stage_id: &str) {
        let Some(stage) = self.definition.stage(stage_id).cloned() else {
            return;
        };
        let inputs = self.inputs_for(stage_id);
        let exec_id = self.exec.id.clone();
        let in_flight = self.in_flight + 1;

        let Some(record) = self.exec.stage_mut(stage_id) else {
            return;
        };
        if let Err(e) = record.transition(StageState::Running) {
            error!(execution_id = %exec_id, error = %e, "Refusing dispatch");
            return;
        }
        record.started_at.get_or_insert_with(Utc::now);
        record.in_flight_at_dispatch = in_flight;
        let attempt = record.retry_count + 1;
        self.in_flight = in_flight;

        info!(execution_id = %exec_id, stage_id, attempt, in_flight, "Stage started");
        self.publish(WorkflowEvent::StageStarted {
            execution_id: exec_id.clone(),
            stage_id: stage_id.to_string(),
            attempt,
        });

        let ctx = ActionContext {
            execution_id: exec_id,
            workflow_id: self.exec.workflow_id.clone(),
            stage_id: stage_id.to_string(),
            attempt,
            inputs,
        };
        let executor = self.engine.stage_executor.clone();
        let granted = self.options.granted_permissions.clone();

        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(executor.execute(&stage, ctx, granted.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    StageOutcome::aborted(
                        attempt,
                        StageFailure::fatal(ErrorKind::ActionFailed, "stage task panicked"),
                    )
                });
            TaskDone::Stage {
                stage_id: stage.id,
                outcome,
            }
        });
    }

    /// Initial data plus the outputs of completed predecessors, keyed by stage id.
    fn inputs_for(&self, stage_id: &str) -> HandoffContext {
        let mut ctx = self.options.initial_context.clone();
        for edge in self.edges.iter().filter(|e| e.to == stage_id) {
            if let Some(dep) = self.exec.stage(&edge.from) {
                if dep.state == StageState::Completed {
                    let output: serde_json::Map<String, serde_json::Value> =
                        dep.output.data().clone().into_iter().collect();
                    ctx.set(edge.from.clone(), serde_json::Value::Object(output));
                }
            }
        }
        ctx
    }

    fn handle_command(&mut self, cmd: ControlCommand) {
        debug!(execution_id = %self.exec.id, ?cmd, "Control command");
        match cmd {
            ControlCommand::Pause if self.exec.status == ExecutionStatus::Running => self.pause(),
            ControlCommand::Resume if self.exec.status == ExecutionStatus::Paused => self.resume(),
            ControlCommand::Cancel if !self.cancelled => self.cancel(),
            _ => debug!(execution_id = %self.exec.id, status = ?self.exec.status, ?cmd, "Command ignored"),
        }
    }

    fn pause(&mut self) {
        self.exec.status = ExecutionStatus::Paused;
        info!(execution_id = %self.exec.id, in_flight = self.in_flight, "Execution paused");
        self.publish(WorkflowEvent::ExecutionPaused {
            execution_id: self.exec.id.clone(),
        });
    }

    fn resume(&mut self) {
        self.exec.status = ExecutionStatus::Running;
        info!(execution_id = %self.exec.id, held = self.held.len(), "Execution resumed");
        self.publish(WorkflowEvent::ExecutionResumed {
            execution_id: self.exec.id.clone(),
        });
        for stage_id in std::mem::take(&mut self.held) {
            if let Some(record) = self.exec.stage_mut(&stage_id) {
                record.retry_count += 1;
            }
            self.queue.push_back(stage_id);
        }
        self.schedule_ready();
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.exec.status = ExecutionStatus::Cancelled;
        info!(
            execution_id = %self.exec.id,
            in_flight = self.in_flight,
            "Execution cancelled, waiting for in-flight stages"
        );
        self.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: self.exec.id.clone(),
        });

        self.queue.clear();
        self.held.clear();
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
        let unsettled: Vec<String> = self
            .exec
            .stages
            .iter()
            .filter(|s| s.state == StageState::Failed && s.completed_at.is_none())
            .map(|s| s.stage_id.clone())
            .collect();
        for stage_id in unsettled {
            self.settle_failed(&stage_id);
        }
    }

    fn handle_done(&mut self, done: TaskDone) {
        match done {
            TaskDone::Stage { stage_id, outcome } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                match outcome.record.failure.clone() {
                    None => self.complete_stage(&stage_id, outcome),
                    Some(failure) => self.fail_stage(&stage_id, outcome, failure),
                }
            }
            TaskDone::RetryDue { stage_id } => {
                self.retry_timers.remove(&stage_id);
                if !self.cancelled {
                    debug!(execution_id = %self.exec.id, stage_id, "Retry due");
                    self.queue.push_back(stage_id);
                }
            }
            TaskDone::Rollback {
                failed_stage,
                compensated,
            } => {
                for stage_id in &compensated {
                    if let Some(record) = self.exec.stage_mut(stage_id) {
                        record.compensated = true;
                    }
                }
                info!(
                    execution_id = %self.exec.id,
                    failed_stage,
                    compensated = compensated.len(),
                    "Rollback completed"
                );
                self.publish(WorkflowEvent::RollbackCompleted {
                    execution_id: self.exec.id.clone(),
                    failed_stage,
                    compensated,
                });
            }
            TaskDone::Notified => {}
        }
    }

    fn complete_stage(&mut self, stage_id: &str, outcome: StageOutcome) {
        let exec_id = self.exec.id.clone();
        let attempt = outcome.record.attempt;
        let now = Utc::now();

        let Some(record) = self.exec.stage_mut(stage_id) else {
            return;
        };
        if let Err(e) = record.transition(StageState::Completed) {
            error!(execution_id = %exec_id, error = %e, "Dropping stage result");
            return;
        }
        let duration_ms = elapsed_ms(record.started_at, now);
        record.completed_at = Some(now);
        record.duration_ms = Some(duration_ms);
        record.attempts.push(outcome.record);
        record.counters = outcome.counters;
        record.output = outcome.output;

        info!(execution_id = %exec_id, stage_id, attempt, duration_ms, "Stage completed");
        self.publish(WorkflowEvent::StageCompleted {
            execution_id: exec_id.clone(),
            stage_id: stage_id.to_string(),
            attempt,
            duration_ms,
        });

        let bottleneck = self.definition.stage(stage_id).and_then(|stage| {
            self.exec
                .stage(stage_id)
                .and_then(|record| self.engine.analyzer.analyze_stage(stage, record))
        });
        if let Some(b) = bottleneck {
            warn!(
                execution_id = %exec_id,
                stage_id,
                delay_pct = b.delay_percentage,
                severity = ?b.severity,
                "Bottleneck detected"
            );
            self.publish(WorkflowEvent::BottleneckDetected {
                execution_id: exec_id,
                stage_id: stage_id.to_string(),
                delay_percentage: b.delay_percentage,
                severity: b.severity,
            });
        }

        self.schedule_ready();
    }

    fn fail_stage(&mut self, stage_id: &str, outcome: StageOutcome, failure: StageFailure) {
        let exec_id = self.exec.id.clone();
        let attempt = outcome.record.attempt;
        let failed_action = outcome.failed_action.clone();

        let retry_count = {
            let Some(record) = self.exec.stage_mut(stage_id) else {
                return;
            };
            record.attempts.push(outcome.record);
            record.counters = outcome.counters;
            record.last_error = Some(failure.clone());
            record.retry_count
        };

        warn!(
            execution_id = %exec_id,
            stage_id,
            attempt,
            kind = %failure.kind,
            error = %failure.message,
            "Stage failed"
        );
        self.publish(WorkflowEvent::StageFailed {
            execution_id: exec_id.clone(),
            stage_id: stage_id.to_string(),
            attempt,
            kind: failure.kind,
            error: failure.message.clone(),
        });

        if self.cancelled {
            if self.transition(stage_id, StageState::Failed) {
                self.settle_failed(stage_id);
            }
            return;
        }

        let definition = self.definition.clone();
        let Some(stage) = definition.stage(stage_id) else {
            return;
        };
        let action = failed_action
            .as_deref()
            .and_then(|id| stage.actions.iter().find(|a| a.id == id));
        let decision = self.engine.policy.decide(stage, &failure, retry_count, action);
        debug!(execution_id = %exec_id, stage_id, ?decision, "Policy decision");

        match decision {
            PolicyDecision::Retry {
                delay,
                next_attempt,
            } => {
                if !self.transition(stage_id, StageState::Failed) {
                    return;
                }
                if let Some(record) = self.exec.stage_mut(stage_id) {
                    record.retry_count += 1;
                }
                let delay_ms = delay.as_millis() as u64;
                info!(execution_id = %exec_id, stage_id, next_attempt, delay_ms, "Retry scheduled");
                self.publish(WorkflowEvent::StageRetryScheduled {
                    execution_id: exec_id,
                    stage_id: stage_id.to_string(),
                    next_attempt,
                    delay_ms,
                });
                let due = stage_id.to_string();
                let timer = self.tasks.spawn(async move {
                    tokio::time::sleep(delay).await;
                    TaskDone::RetryDue { stage_id: due }
                });
                self.retry_timers.insert(stage_id.to_string(), timer);
            }
            PolicyDecision::Skip => {
                if !self.transition(stage_id, StageState::Skipped) {
                    return;
                }
                let now = Utc::now();
                if let Some(record) = self.exec.stage_mut(stage_id) {
                    record.skip_reason = Some(SkipReason::Policy);
                    record.completed_at = Some(now);
                    record.duration_ms = Some(elapsed_ms(record.started_at, now));
                }
                info!(execution_id = %exec_id, stage_id, "Stage skipped by policy");
                self.publish(WorkflowEvent::StageSkipped {
                    execution_id: exec_id,
                    stage_id: stage_id.to_string(),
                    reason: SkipReason::Policy,
                });
                self.schedule_ready();
            }
            PolicyDecision::Pause => {
                if !self.transition(stage_id, StageState::Failed) {
                    return;
                }
                self.held.push(stage_id.to_string());
                if self.exec.status == ExecutionStatus::Running {
                    self.pause();
                }
            }
            PolicyDecision::Escalate {
                roles,
                notification,
            } => {
                if !self.transition(stage_id, StageState::Failed) {
                    return;
                }
                self.settle_failed(stage_id);
                error!(execution_id = %exec_id, stage_id, ?roles, "Stage escalated");
                self.publish(WorkflowEvent::StageEscalated {
                    execution_id: exec_id.clone(),
                    stage_id: stage_id.to_string(),
                    roles: roles.clone(),
                });

                let payload = Notification {
                    execution_id: exec_id,
                    workflow_id: self.exec.workflow_id.clone(),
                    stage_id: stage_id.to_string(),
                    roles,
                    kind: failure.kind,
                    message: failure.message,
                };
                let notifier = self.engine.notifier.clone();
                self.tasks.spawn(async move {
                    let channel = notification.channel.clone();
                    if let Err(e) = notifier.notify(notification, payload).await {
                        warn!(%channel, error = %e, "Escalation notification failed");
                    }
                    TaskDone::Notified
                });
                self.schedule_ready();
            }
            PolicyDecision::Rollback => {
                if !self.transition(stage_id, StageState::Failed) {
                    return;
                }
                self.settle_failed(stage_id);
                self.spawn_rollback(stage_id);
                self.schedule_ready();
            }
        }
    }

    fn transition(&mut self, stage_id: &str, next: StageState) -> bool {
        let exec_id = self.exec.id.clone();
        match self.exec.stage_mut(stage_id).map(|r| r.transition(next)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                error!(execution_id = %exec_id, error = %e, "Invalid stage transition");
                false
            }
            None => false,
        }
    }

    /// Record the end of a failed stage that will not run again.
    fn settle_failed(&mut self, stage_id: &str) {
        let now = Utc::now();
        if let Some(record) = self.exec.stage_mut(stage_id) {
            record.completed_at = Some(now);
            record.duration_ms = Some(elapsed_ms(record.started_at, now));
        }
    }

    /// Run compensation for completed upstream stages, most recent first.
    fn spawn_rollback(&mut self, failed_stage: &str) {
        let mut upstream = HashSet::new();
        let mut frontier = vec![failed_stage.to_string()];
        while let Some(current) = frontier.pop() {
            for edge in self.edges.iter().filter(|e| e.to == current) {
                if upstream.insert(edge.from.clone()) {
                    frontier.push(edge.from.clone());
                }
            }
        }

        // (definition index, stage, its output, completion time)
        let mut targets: Vec<(usize, Stage, HandoffContext, Option<DateTime<Utc>>)> = self
            .definition
            .stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| upstream.contains(&stage.id) && !stage.compensation.is_empty())
            .filter_map(|(index, stage)| {
                let record = self.exec.stage(&stage.id)?;
                (record.state == StageState::Completed).then(|| {
                    (index, stage.clone(), record.output.clone(), record.completed_at)
                })
            })
            .collect();
        targets.sort_by(|a, b| b.3.cmp(&a.3).then(b.0.cmp(&a.0)));

        info!(
            execution_id = %self.exec.id,
            failed_stage,
            stages = targets.len(),
            "Rolling back upstream stages"
        );

        let actions = self.engine.actions.clone();
        let execution_id = self.exec.id.clone();
        let workflow_id = self.exec.workflow_id.clone();
        let failed_stage = failed_stage.to_string();

        self.tasks.spawn(async move {
            let mut compensated = Vec::new();
            for (_, stage, output, _) in targets {
                for action in &stage.compensation {
                    let ctx = ActionContext {
                        execution_id: execution_id.clone(),
                        workflow_id: workflow_id.clone(),
                        stage_id: stage.id.clone(),
                        attempt: 1,
                        inputs: output.clone(),
                    };
                    let result = tokio::time::timeout(
                        Duration::from_secs(action.timeout_secs),
                        actions.execute(action.clone(), ctx),
                    )
                    .await;
                    match result {
                        Ok(Ok(_)) => {
                            debug!(stage_id = %stage.id, action_id = %action.id, "Compensating action done")
                        }
                        Ok(Err(e)) => warn!(
                            stage_id = %stage.id,
                            action_id = %action.id,
                            error = %e,
                            "Compensating action failed"
                        ),
                        Err(_) => warn!(
                            stage_id = %stage.id,
                            action_id = %action.id,
                            "Compensating action timed out"
                        ),
                    }
                }
                compensated.push(stage.id.clone());
            }
            TaskDone::Rollback {
                failed_stage,
                compensated,
            }
        });
    }

    /// Queue newly ready stages and skip those whose dependencies can no
    /// longer be satisfied, until nothing changes.
    fn schedule_ready(&mut self) {
        if self.cancelled {
            return;
        }
        let definition = self.definition.clone();
        loop {
            let mut changed = false;
            for stage in &definition.stages {
                let pending = self
                    .exec
                    .stage(&stage.id)
                    .is_some_and(|r| r.state == StageState::Pending);
                if !pending || self.queue.contains(&stage.id) {
                    continue;
                }
                match self.readiness(&stage.id) {
                    Readiness::Ready => {
                        if let Some(record) = self.exec.stage_mut(&stage.id) {
                            record.queued_at.get_or_insert_with(Utc::now);
                        }
                        debug!(execution_id = %self.exec.id, stage_id = %stage.id, "Stage ready");
                        self.queue.push_back(stage.id.clone());
                    }
                    Readiness::Blocked => {}
                    Readiness::Unsatisfiable => {
                        self.skip_pending(&stage.id, SkipReason::UpstreamFailed);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn readiness(&self, stage_id: &str) -> Readiness {
        let skipped_default = self.engine.config.skipped_satisfies_dependency;
        let mut ready = true;
        for edge in self.edges.iter().filter(|e| e.to == stage_id) {
            let Some(dep) = self.exec.stage(&edge.from) else {
                continue;
            };
            match dep.state {
                StageState::Completed => {}
                StageState::Skipped => {
                    if !edge.skipped_satisfies.unwrap_or(skipped_default) {
                        return Readiness::Unsatisfiable;
                    }
                }
                StageState::Failed if self.is_recovering(&edge.from) => ready = false,
                StageState::Failed => return Readiness::Unsatisfiable,
                StageState::Pending | StageState::Running => ready = false,
            }
        }
        if ready {
            Readiness::Ready
        } else {
            Readiness::Blocked
        }
    }

    /// A failed stage that will run again (retry timer, queued retry, or held).
    fn is_recovering(&self, stage_id: &str) -> bool {
        self.retry_timers.contains_key(stage_id)
            || self.held.iter().any(|s| s == stage_id)
            || self.queue.iter().any(|s| s == stage_id)
    }

    fn skip_pending(&mut self, stage_id: &str, reason: SkipReason) {
        if !self.transition(stage_id, StageState::Skipped) {
            return;
        }
        if let Some(record) = self.exec.stage_mut(stage_id) {
            record.skip_reason = Some(reason);
            record.completed_at = Some(Utc::now());
        }
        info!(execution_id = %self.exec.id, stage_id, %reason, "Stage skipped");
        self.publish(WorkflowEvent::StageSkipped {
            execution_id: self.exec.id.clone(),
            stage_id: stage_id.to_string(),
            reason,
        });
    }

    /// Recompute derived state and publish it to snapshot readers.
    fn refresh(&mut self) {
        let now = Utc::now();
        let bottlenecks = self.engine.analyzer.bottlenecks(&self.definition, &self.exec);
        let sla = self.engine.analyzer.sla_status(&self.definition, &self.exec, now);
        if sla != self.exec.sla_status {
            warn!(
                execution_id = %self.exec.id,
                from = %self.exec.sla_status,
                to = %sla,
                "SLA status changed"
            );
            self.publish(WorkflowEvent::SlaStatusChanged {
                execution_id: self.exec.id.clone(),
                from: self.exec.sla_status,
                to: sla,
            });
            self.exec.sla_status = sla;
        }
        let metrics = self.engine.aggregator.compute(&self.exec, &bottlenecks, sla);
        self.exec.metrics = metrics;
        self.exec.bottlenecks = bottlenecks;
        self.state.send_replace(self.exec.clone());
    }

    fn finish(mut self) -> WorkflowExecution {
        if self.exec.status == ExecutionStatus::Paused {
            self.cancel();
        }

        let reason = if self.cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::UpstreamFailed
        };
        let pending: Vec<String> = self
            .exec
            .stages
            .iter()
            .filter(|s| s.state == StageState::Pending)
            .map(|s| s.stage_id.clone())
            .collect();
        for stage_id in pending {
            self.skip_pending(&stage_id, reason);
        }

        if !self.cancelled {
            let any_failed = self.exec.stages.iter().any(|s| s.state == StageState::Failed);
            self.exec.status = if any_failed {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
        }
        self.exec.completed_at = Some(Utc::now());
        self.refresh();

        info!(
            execution_id = %self.exec.id,
            status = ?self.exec.status,
            score = self.exec.metrics.performance_score,
            sla = %self.exec.sla_status,
            "Execution finished"
        );
        self.publish(WorkflowEvent::ExecutionFinished {
            execution_id: self.exec.id.clone(),
            status: self.exec.status,
            performance_score: self.exec.metrics.performance_score,
        });
        self.exec
    }
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxflow_core::config::RetryConfig;
    use taxflow_core::definition::{ErrorHandlingRule, ResponseAction, Role};
    use taxflow_test_utils::{
        linear_chain, simple_stage, work_action, RecordingNotifier, ScriptedActionExecutor,
    };

    fn engine_with(
        actions: Arc<ScriptedActionExecutor>,
        notifier: Arc<RecordingNotifier>,
    ) -> ExecutionEngine {
        ExecutionEngine::new(&AppConfig::default(), actions, notifier, Arc::new(EventBus::default()))
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            delay_seconds: 0.01,
            backoff_multiplier: 2.0,
            max_delay_seconds: 1.0,
        }
    }

    #[tokio::test]
    async fn test_invalid_definition_is_refused() {
        let engine = engine_with(
            Arc::new(ScriptedActionExecutor::new()),
            Arc::new(RecordingNotifier::new()),
        );
        let def = WorkflowDefinition::new("loop", "Loop")
            .with_stage(simple_stage("a").depends_on(&["b"]))
            .with_stage(simple_stage("b").depends_on(&["a"]));
        let err = engine.start(def, ExecutionOptions::default()).err().unwrap();
        assert!(matches!(err, TaxflowError::DefinitionInvalid { .. }));
        assert!(err.to_string().contains("circular dependency"));
    }

    #[tokio::test]
    async fn test_outputs_flow_to_dependents() {
        let actions = Arc::new(
            ScriptedActionExecutor::new()
                .with_payload("a-work", serde_json::json!({"batch": "2026-09"})),
        );
        let engine = engine_with(actions.clone(), Arc::new(RecordingNotifier::new()));
        let mut initial = HandoffContext::new();
        initial.set_str("tenant", "acme");

        let exec = engine
            .run(
                linear_chain(&["a", "b"]),
                ExecutionOptions::default().with_context(initial),
            )
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);

        let call = actions
            .calls()
            .into_iter()
            .find(|c| c.action_id == "b-work")
            .unwrap();
        assert_eq!(call.inputs.get_str("tenant"), Some("acme"));
        assert_eq!(
            call.inputs.get("a"),
            Some(&serde_json::json!({"batch": "2026-09"}))
        );
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let actions = Arc::new(ScriptedActionExecutor::new().fail_times("b-work", 2, "503 busy"));
        let engine = engine_with(actions.clone(), Arc::new(RecordingNotifier::new()));
        let mut def = linear_chain(&["a", "b"]);
        def.stages[1] = simple_stage("b")
            .depends_on(&["a"])
            .with_rule(ErrorHandlingRule::new(None, ResponseAction::Retry).with_retry(fast_retry(3)));

        let exec = engine.run(def, ExecutionOptions::default()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let b = exec.stage("b").unwrap();
        assert_eq!(b.retry_count, 2);
        assert_eq!(b.attempts.len(), 3);
        assert!(b.attempts[0].failure.is_some());
        assert!(b.attempts[2].failure.is_none());
        assert_eq!(actions.call_count("b-work"), 3);
        assert_eq!(exec.metrics.total_retries, 2);
    }

    #[tokio::test]
    async fn test_skip_policy_lets_dependents_run() {
        let actions = Arc::new(ScriptedActionExecutor::new().always_fail("b-work", "optional feed down"));
        let engine = engine_with(actions, Arc::new(RecordingNotifier::new()));
        let mut def = linear_chain(&["a", "b", "c"]);
        def.stages[1] = simple_stage("b")
            .depends_on(&["a"])
            .with_rule(ErrorHandlingRule::new(None, ResponseAction::Skip));

        let exec = engine.run(def, ExecutionOptions::default()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.stage("b").unwrap().state, StageState::Skipped);
        assert_eq!(exec.stage("b").unwrap().skip_reason, Some(SkipReason::Policy));
        assert_eq!(exec.stage("c").unwrap().state, StageState::Completed);
    }

    #[tokio::test]
    async fn test_strict_edge_rejects_skipped_dependency() {
        let actions = Arc::new(ScriptedActionExecutor::new().always_fail("b-work", "down"));
        let engine = engine_with(actions, Arc::new(RecordingNotifier::new()));
        let mut def = linear_chain(&["a", "b"]);
        def.stages[1] = simple_stage("b")
            .depends_on(&["a"])
            .with_rule(ErrorHandlingRule::new(None, ResponseAction::Skip));
        def = def
            .with_stage(simple_stage("c"))
            .with_dependency(Dependency::new("b", "c").strict());

        let exec = engine.run(def, ExecutionOptions::default()).await.unwrap();
        let c = exec.stage("c").unwrap();
        assert_eq!(c.state, StageState::Skipped);
        assert_eq!(c.skip_reason, Some(SkipReason::UpstreamFailed));
    }

    #[tokio::test]
    async fn test_escalation_notifies_roles() {
        let actions = Arc::new(ScriptedActionExecutor::new().always_fail("b-work", "rejected"));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(actions, notifier.clone());
        let mut def = linear_chain(&["a", "b", "c"]);
        def.stages[1] = simple_stage("b").depends_on(&["a"]).with_rule(
            ErrorHandlingRule::new(None, ResponseAction::Escalate)
                .escalate_to(vec![Role::Transmission]),
        );

        let exec = engine.run(def, ExecutionOptions::default()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.stage("c").unwrap().skip_reason, Some(SkipReason::UpstreamFailed));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.channel, "escalation");
        assert_eq!(sent[0].1.stage_id, "b");
        assert_eq!(sent[0].1.roles, vec![Role::Transmission]);
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_fail_engine() {
        let actions = Arc::new(ScriptedActionExecutor::new().always_fail("a-work", "boom"));
        let notifier = Arc::new(RecordingNotifier::failing());
        let engine = engine_with(actions, notifier.clone());

        let exec = engine
            .run(linear_chain(&["a"]), ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_compensates_upstream_in_reverse_order() {
        let actions = Arc::new(ScriptedActionExecutor::new().always_fail("c-work", "SDI rejected"));
        let engine = engine_with(actions.clone(), Arc::new(RecordingNotifier::new()));
        let def = WorkflowDefinition::new("rb", "Rollback")
            .with_stage(simple_stage("a").with_compensation(work_action("undo-a")))
            .with_stage(
                simple_stage("b")
                    .depends_on(&["a"])
                    .with_compensation(work_action("undo-b")),
            )
            .with_stage(
                simple_stage("c")
                    .depends_on(&["b"])
                    .with_rule(ErrorHandlingRule::new(None, ResponseAction::Rollback)),
            );

        let exec = engine.run(def, ExecutionOptions::default()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.stage("a").unwrap().compensated);
        assert!(exec.stage("b").unwrap().compensated);
        assert!(!exec.stage("c").unwrap().compensated);

        let order: Vec<String> = actions
            .calls()
            .into_iter()
            .filter(|c| c.action_id.starts_with("undo"))
            .map(|c| c.action_id)
            .collect();
        assert_eq!(order, vec!["undo-b", "undo-a"]);
    }

    #[tokio::test]
    async fn test_pause_rule_holds_until_resume() {
        let actions = Arc::new(ScriptedActionExecutor::new().fail_times("b-work", 1, "awaiting approval"));
        let engine = engine_with(actions.clone(), Arc::new(RecordingNotifier::new()));
        let mut def = linear_chain(&["a", "b"]);
        def.stages[1] = simple_stage("b")
            .depends_on(&["a"])
            .with_rule(ErrorHandlingRule::new(None, ResponseAction::Pause));

        let handle = engine.start(def, ExecutionOptions::default()).unwrap();
        let mut rx = handle.state.clone();
        rx.wait_for(|e| e.status == ExecutionStatus::Paused).await.unwrap();
        assert_eq!(handle.snapshot().status, ExecutionStatus::Paused);
        assert_eq!(handle.execution().stage("b").unwrap().state, StageState::Failed);

        handle.resume().await.unwrap();
        let exec = handle.wait().await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let b = exec.stage("b").unwrap();
        assert_eq!(b.state, StageState::Completed);
        assert_eq!(b.retry_count, 1);
        assert_eq!(actions.call_count("b-work"), 2);
    }

    #[tokio::test]
    async fn test_external_pause_holds_dispatch_until_resume() {
        let actions = Arc::new(
            ScriptedActionExecutor::new().with_delay("a-work", Duration::from_millis(50)),
        );
        let engine = engine_with(actions.clone(), Arc::new(RecordingNotifier::new()));
        let handle = engine
            .start(linear_chain(&["a", "b"]), ExecutionOptions::default())
            .unwrap();
        let mut rx = handle.state.clone();
        rx.wait_for(|e| e.stage("a").is_some_and(|s| s.state == StageState::Running))
            .await
            .unwrap();

        handle.pause().await.unwrap();
        rx.wait_for(|e| e.status == ExecutionStatus::Paused).await.unwrap();

        // The in-flight stage finishes; its dependent is not dispatched
        rx.wait_for(|e| e.stage("a").is_some_and(|s| s.state == StageState::Completed))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let paused = handle.execution();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.stage("b").unwrap().state, StageState::Pending);
        assert_eq!(actions.call_count("b-work"), 0);

        handle.resume().await.unwrap();
        let exec = handle.wait().await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.stage("b").unwrap().state, StageState::Completed);
        assert_eq!(actions.call_count("b-work"), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_paused_drops_held_stage() {
        let actions = Arc::new(ScriptedActionExecutor::new().always_fail("b-work", "awaiting approval"));
        let engine = engine_with(actions.clone(), Arc::new(RecordingNotifier::new()));
        let mut def = linear_chain(&["a", "b", "c"]);
        def.stages[1] = simple_stage("b")
            .depends_on(&["a"])
            .with_rule(ErrorHandlingRule::new(None, ResponseAction::Pause));

        let handle = engine.start(def, ExecutionOptions::default()).unwrap();
        let mut rx = handle.state.clone();
        rx.wait_for(|e| e.status == ExecutionStatus::Paused).await.unwrap();
        assert_eq!(handle.execution().stage("b").unwrap().state, StageState::Failed);

        handle.cancel().await.unwrap();
        let exec = handle.wait().await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        let b = exec.stage("b").unwrap();
        assert_eq!(b.state, StageState::Failed);
        assert_eq!(b.retry_count, 0);
        assert!(b.completed_at.is_some());
        let c = exec.stage("c").unwrap();
        assert_eq!(c.state, StageState::Skipped);
        assert_eq!(c.skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(actions.call_count("b-work"), 1);
        assert_eq!(actions.call_count("c-work"), 0);
    }

    #[tokio::test]
    async fn test_ready_stages_dispatch_in_arrival_order_at_cap() {
        // `late` is defined first but becomes ready only after `slow` finishes,
        // behind `other` which was queued at start.
        let mut config = AppConfig::default();
        config.engine.max_concurrent_stages = 1;
        let actions = Arc::new(
            ScriptedActionExecutor::new().with_delay("slow-work", Duration::from_millis(30)),
        );
        let engine = ExecutionEngine::new(
            &config,
            actions.clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(EventBus::default()),
        );
        let def = WorkflowDefinition::new("fifo", "FIFO")
            .with_stage(simple_stage("late").depends_on(&["slow"]))
            .with_stage(simple_stage("slow"))
            .with_stage(simple_stage("other"));

        let exec = engine.run(def, ExecutionOptions::default()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);

        let order: Vec<String> = actions.calls().into_iter().map(|c| c.action_id).collect();
        assert_eq!(order, vec!["slow-work", "other-work", "late-work"]);
        assert!(exec.stages.iter().all(|s| s.in_flight_at_dispatch == 1));
        let other = exec.stage("other").unwrap();
        let late = exec.stage("late").unwrap();
        assert!(other.queued_at.unwrap() <= late.queued_at.unwrap());
        assert!(late.started_at.unwrap() >= other.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_permission_denied_fails_stage() {
        let engine = engine_with(
            Arc::new(ScriptedActionExecutor::new()),
            Arc::new(RecordingNotifier::new()),
        );
        let exec = engine
            .run(
                linear_chain(&["a"]),
                ExecutionOptions::default().with_permissions(["sdi.submit"]),
            )
            .await
            .unwrap();
        let a = exec.stage("a").unwrap();
        assert_eq!(a.state, StageState::Failed);
        assert_eq!(a.last_error.as_ref().unwrap().kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let engine = engine_with(
            Arc::new(ScriptedActionExecutor::new()),
            Arc::new(RecordingNotifier::new()),
        );
        let mut rx = engine.event_bus().subscribe();
        engine
            .run(linear_chain(&["a"]), ExecutionOptions::default())
            .await
            .unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let json = serde_json::to_value(&event).unwrap();
            names.push(json["event"].as_str().unwrap().to_string());
        }
        assert_eq!(
            names,
            vec![
                "execution_started",
                "stage_started",
                "stage_completed",
                "execution_finished"
            ]
        );
    }
}
