use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taxflow_core::definition::{TriggerKind, WorkflowDefinition};
use taxflow_core::{ExecutionOptions, HandoffContext, Result, TaxflowError, WorkflowEvent};

use crate::condition::evaluate_condition;
use crate::engine::{ExecutionEngine, ExecutionHandle};

struct CronJob {
    workflow_id: String,
    trigger_id: String,
    schedule: Schedule,
}

/// Starts executions from workflow triggers: cron schedules, external
/// events, conditions over reported data, and manual requests.
pub struct TriggerScheduler {
    engine: ExecutionEngine,
    workflows: Vec<Arc<WorkflowDefinition>>,
    jobs: Vec<CronJob>,
    cancel: CancellationToken,
}

impl TriggerScheduler {
    pub fn new(engine: ExecutionEngine, cancel: CancellationToken) -> Self {
        Self {
            engine,
            workflows: Vec::new(),
            jobs: Vec::new(),
            cancel,
        }
    }

    /// Register a definition. Invalid definitions are rejected; a definition
    /// with the same id replaces the earlier one.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<()> {
        let report = self.engine.validate(&definition);
        if !report.valid {
            return Err(TaxflowError::DefinitionInvalid {
                errors: report.errors,
            });
        }

        self.workflows.retain(|w| w.id != definition.id);
        self.jobs.retain(|j| j.workflow_id != definition.id);

        for trigger in definition.triggers.iter().filter(|t| t.enabled) {
            if let TriggerKind::Schedule { cron } = &trigger.kind {
                match Schedule::from_str(cron) {
                    Ok(schedule) => {
                        info!(
                            workflow_id = %definition.id,
                            trigger_id = %trigger.id,
                            %cron,
                            "Schedule trigger registered"
                        );
                        self.jobs.push(CronJob {
                            workflow_id: definition.id.clone(),
                            trigger_id: trigger.id.clone(),
                            schedule,
                        });
                    }
                    Err(e) => {
                        warn!(trigger_id = %trigger.id, error = %e, "Invalid cron expression, skipping")
                    }
                }
            }
        }

        self.workflows.push(Arc::new(definition));
        Ok(())
    }

    pub fn workflows(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.iter().map(|w| w.as_ref())
    }

    /// Start every workflow with an enabled event trigger for `event_type`.
    pub fn fire_event(&self, event_type: &str) -> Vec<ExecutionHandle> {
        self.fire_matching(HandoffContext::new(), |kind| {
            matches!(kind, TriggerKind::Event { event_type: t } if t == event_type)
        })
    }

    /// Start every workflow whose enabled condition trigger holds for `context`.
    /// The context becomes the execution's initial handoff data.
    pub fn evaluate_conditions(&self, context: &HandoffContext) -> Vec<ExecutionHandle> {
        self.fire_matching(context.clone(), |kind| {
            matches!(kind, TriggerKind::Condition { expr } if evaluate_condition(expr, context))
        })
    }

    /// Start a workflow through its manual trigger.
    pub fn start_manual(&self, workflow_id: &str, options: ExecutionOptions) -> Result<ExecutionHandle> {
        let definition = self
            .workflows
            .iter()
            .find(|w| w.id == workflow_id)
            .ok_or_else(|| TaxflowError::UnknownWorkflow(workflow_id.to_string()))?;
        let trigger = definition
            .triggers
            .iter()
            .find(|t| t.enabled && t.kind == TriggerKind::Manual)
            .ok_or_else(|| TaxflowError::NoTrigger {
                workflow_id: workflow_id.to_string(),
                kind: "manual".to_string(),
            })?;

        self.announce(&definition.id, &trigger.id);
        self.engine.start(definition.clone(), options)
    }

    fn fire_matching<F>(&self, context: HandoffContext, matches: F) -> Vec<ExecutionHandle>
    where
        F: Fn(&TriggerKind) -> bool,
    {
        let mut handles = Vec::new();
        for definition in &self.workflows {
            let Some(trigger) = definition
                .triggers
                .iter()
                .find(|t| t.enabled && matches(&t.kind))
            else {
                continue;
            };
            self.announce(&definition.id, &trigger.id);
            let options = ExecutionOptions::default().with_context(context.clone());
            match self.engine.start(definition.clone(), options) {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(workflow_id = %definition.id, error = %e, "Trigger failed to start execution"),
            }
        }
        handles
    }

    fn announce(&self, workflow_id: &str, trigger_id: &str) {
        info!(workflow_id, trigger_id, "Trigger fired");
        self.engine.event_bus().publish(WorkflowEvent::TriggerFired {
            workflow_id: workflow_id.to_string(),
            trigger_id: trigger_id.to_string(),
        });
    }

    /// Run the schedule loop. Blocks until cancelled.
    pub async fn run(&self) {
        if self.jobs.is_empty() {
            info!("No schedule triggers registered, scheduler idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.jobs.len(), "Trigger scheduler started");

        loop {
            let now = Utc::now();
            let next_fire = self
                .jobs
                .iter()
                .filter_map(|job| job.schedule.upcoming(Utc).next().map(|at| (at, job)))
                .min_by_key(|(at, _)| *at);

            let Some((fire_at, job)) = next_fire else {
                self.cancel.cancelled().await;
                break;
            };

            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));
            info!(
                workflow_id = %job.workflow_id,
                trigger_id = %job.trigger_id,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next schedule trigger"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => self.fire_scheduled(job),
                _ = self.cancel.cancelled() => {
                    info!("Trigger scheduler shutting down");
                    break;
                }
            }
        }
    }

    fn fire_scheduled(&self, job: &CronJob) {
        let Some(definition) = self.workflows.iter().find(|w| w.id == job.workflow_id) else {
            return;
        };
        self.announce(&job.workflow_id, &job.trigger_id);
        match self.engine.start(definition.clone(), ExecutionOptions::default()) {
            Ok(handle) => {
                tokio::spawn(async move {
                    match handle.wait().await {
                        Ok(exec) => info!(
                            execution_id = %exec.id,
                            status = ?exec.status,
                            "Scheduled execution finished"
                        ),
                        Err(e) => error!(error = %e, "Scheduled execution failed"),
                    }
                });
            }
            Err(e) => error!(workflow_id = %job.workflow_id, error = %e, "Schedule trigger failed"),
        }
    }
}
