//! Bottleneck detection and SLA classification.
//!
//! Both are read-only views over a `WorkflowExecution`; the engine calls them
//! after every stage transition.

use chrono::{DateTime, TimeDelta, Utc};

use taxflow_core::config::AnalysisConfig;
use taxflow_core::definition::{Stage, StageKind, WorkflowDefinition};
use taxflow_core::execution::{
    ActionStatus, Bottleneck, Severity, SlaStatus, StageExecution, StageState, WorkflowExecution,
};
use taxflow_core::ErrorKind;

#[derive(Debug, Clone)]
pub struct BottleneckAnalyzer {
    config: AnalysisConfig,
    max_concurrency: usize,
}

impl BottleneckAnalyzer {
    pub fn new(config: AnalysisConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            max_concurrency,
        }
    }

    /// Analyze a completed stage. Stages without an expected duration are skipped.
    pub fn analyze_stage(&self, stage: &Stage, exec: &StageExecution) -> Option<Bottleneck> {
        if exec.state != StageState::Completed {
            return None;
        }
        let expected = stage.expected_duration_secs as f64;
        let actual = exec.duration_ms? as f64 / 1000.0;
        let delay = delay_percentage(expected, actual)?;
        if delay <= self.config.delay_threshold_pct {
            return None;
        }

        Some(Bottleneck {
            stage_id: stage.id.clone(),
            stage_kind: stage.kind,
            expected_secs: expected,
            actual_secs: actual,
            delay_percentage: delay,
            severity: severity_for(delay),
            root_causes: self.root_causes(exec, expected),
            recommended_actions: recommended_actions(stage.kind),
        })
    }

    /// All bottlenecks in the execution, in definition order.
    pub fn bottlenecks(&self, def: &WorkflowDefinition, exec: &WorkflowExecution) -> Vec<Bottleneck> {
        def.stages
            .iter()
            .filter_map(|stage| {
                exec.stage(&stage.id)
                    .and_then(|record| self.analyze_stage(stage, record))
            })
            .collect()
    }

    fn root_causes(&self, exec: &StageExecution, expected_secs: f64) -> Vec<String> {
        let mut causes = Vec::new();

        if exec.retry_count > 0 {
            causes.push(format!(
                "{} retr{} before success",
                exec.retry_count,
                if exec.retry_count == 1 { "y" } else { "ies" }
            ));
        }

        let timed_out = exec.attempts.iter().any(|a| {
            a.actions.iter().any(|r| r.status == ActionStatus::TimedOut)
                || a.failure.as_ref().is_some_and(|f| f.kind == ErrorKind::ActionTimeout)
        });
        if timed_out {
            causes.push("action timeouts in attempt history".to_string());
        }

        if self.max_concurrency > 0 && exec.in_flight_at_dispatch >= self.max_concurrency {
            causes.push(format!(
                "dispatched at the concurrency cap ({} stages in flight)",
                exec.in_flight_at_dispatch
            ));
        }

        if let (Some(queued), Some(started)) = (exec.queued_at, exec.started_at) {
            let wait = (started - queued).num_milliseconds().max(0) as f64 / 1000.0;
            if wait > 0.0 && wait >= expected_secs * 0.1 {
                causes.push(format!("waited {:.1}s in the ready queue", wait));
            }
        }

        if causes.is_empty() {
            causes.push("slow external processing with no retries or contention".to_string());
        }
        causes
    }

    /// Classify the execution against its deadline at time `now`.
    pub fn sla_status(
        &self,
        def: &WorkflowDefinition,
        exec: &WorkflowExecution,
        now: DateTime<Utc>,
    ) -> SlaStatus {
        let Some(deadline) = exec.deadline() else {
            return SlaStatus::OnTrack;
        };

        if let Some(finished) = exec.completed_at {
            return if finished > deadline {
                SlaStatus::Breached
            } else {
                SlaStatus::OnTrack
            };
        }

        if now > deadline {
            return SlaStatus::Breached;
        }

        let remaining_secs: f64 = def
            .stages
            .iter()
            .filter_map(|stage| {
                let record = exec.stage(&stage.id)?;
                let expected = stage.expected_duration_secs as f64;
                match record.state {
                    StageState::Pending => Some(expected),
                    StageState::Running => {
                        let elapsed = record
                            .started_at
                            .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0)
                            .unwrap_or(0.0);
                        Some((expected - elapsed).max(0.0))
                    }
                    _ => None,
                }
            })
            .sum();

        // Out-of-range projections land after any deadline; an out-of-range
        // margin puts every projection inside it.
        let projected = TimeDelta::try_milliseconds((remaining_secs * 1000.0) as i64)
            .and_then(|d| now.checked_add_signed(d));
        let threshold = i64::try_from(self.config.at_risk_margin_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|margin| deadline.checked_sub_signed(margin));
        match (projected, threshold) {
            (Some(projected), Some(threshold)) if projected < threshold => SlaStatus::OnTrack,
            _ => SlaStatus::AtRisk,
        }
    }
}

impl Default for BottleneckAnalyzer {
    fn default() -> Self {
        Self::new(AnalysisConfig::default(), 4)
    }
}

/// `(actual - expected) / expected * 100`, or `None` when nothing was expected.
pub fn delay_percentage(expected_secs: f64, actual_secs: f64) -> Option<f64> {
    if expected_secs <= 0.0 {
        return None;
    }
    Some((actual_secs - expected_secs) / expected_secs * 100.0)
}

pub fn severity_for(delay_percentage: f64) -> Severity {
    if delay_percentage < 50.0 {
        Severity::Low
    } else if delay_percentage < 100.0 {
        Severity::Medium
    } else if delay_percentage < 200.0 {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// Fixed remediation catalogue per stage kind.
pub fn recommended_actions(kind: StageKind) -> Vec<String> {
    let actions: &[&str] = match kind {
        StageKind::Extraction => &[
            "Extract incrementally instead of full batches",
            "Add an index or cache on the source system query",
        ],
        StageKind::Validation => &[
            "Run validation rules in parallel per document",
            "Pre-validate data at the source before extraction",
        ],
        StageKind::Transformation => &[
            "Cache reference data used by the mapping",
            "Split large batches into smaller chunks",
        ],
        StageKind::Transmission => &[
            "Check the authority gateway status and connection pooling",
            "Tune retry backoff for transient transmission errors",
        ],
        StageKind::Acknowledgment => &[
            "Poll for receipts more frequently or subscribe to push notifications",
            "Reconcile pending receipts in a separate stage",
        ],
        StageKind::Custom => &["Review the stage's actions for external latency"],
    };
    actions.iter().map(|s| s.to_string()).collect()
}
