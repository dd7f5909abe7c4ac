//! Rolls per-stage counters up into `ExecutionMetrics` and scores the run.
//!
//! Score (0-100) = 100 x weighted mean of:
//! - success rate: documents succeeded / processed, or completed / finished
//!   stages when no documents were processed
//! - SLA adherence: on_track 1.0, at_risk 0.5, breached 0.0
//! - absence of bottlenecks: 1 - bottlenecked / completed stages

use taxflow_core::config::ScoringConfig;
use taxflow_core::execution::{
    Bottleneck, ExecutionMetrics, SlaStatus, StageCounters, StageState, WorkflowExecution,
};

#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    weights: ScoringConfig,
}

impl MetricsAggregator {
    pub fn new(weights: ScoringConfig) -> Self {
        Self { weights }
    }

    /// Sum counters. Order does not matter.
    pub fn aggregate<'a, I>(counters: I) -> StageCounters
    where
        I: IntoIterator<Item = &'a StageCounters>,
    {
        counters.into_iter().fold(StageCounters::default(), |mut acc, c| {
            acc.merge(c);
            acc
        })
    }

    pub fn compute(
        &self,
        exec: &WorkflowExecution,
        bottlenecks: &[Bottleneck],
        sla: SlaStatus,
    ) -> ExecutionMetrics {
        let totals = Self::aggregate(exec.stages.iter().map(|s| &s.counters));
        let count = |state: StageState| exec.stages.iter().filter(|s| s.state == state).count();
        let completed = count(StageState::Completed);
        let failed = count(StageState::Failed);
        let skipped = count(StageState::Skipped);

        let success_rate = if totals.documents_processed > 0 {
            totals.documents_succeeded as f64 / totals.documents_processed as f64
        } else if completed + failed > 0 {
            completed as f64 / (completed + failed) as f64
        } else {
            1.0
        };
        let bottleneck_ratio = if completed > 0 {
            bottlenecks.len() as f64 / completed as f64
        } else {
            0.0
        };

        ExecutionMetrics {
            documents_processed: totals.documents_processed,
            documents_succeeded: totals.documents_succeeded,
            documents_failed: totals.documents_failed,
            data_volume_bytes: totals.data_volume_bytes,
            external_calls: totals.external_calls,
            cache_hits: totals.cache_hits,
            stages_completed: completed,
            stages_failed: failed,
            stages_skipped: skipped,
            total_retries: exec.stages.iter().map(|s| s.retry_count).sum(),
            performance_score: self.performance_score(success_rate, sla, bottleneck_ratio),
        }
    }

    pub fn performance_score(&self, success_rate: f64, sla: SlaStatus, bottleneck_ratio: f64) -> f64 {
        let w = &self.weights;
        let total_weight = w.success_weight + w.sla_weight + w.bottleneck_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }
        let sla_score = match sla {
            SlaStatus::OnTrack => 1.0,
            SlaStatus::AtRisk => 0.5,
            SlaStatus::Breached => 0.0,
        };
        let weighted = w.success_weight * success_rate.clamp(0.0, 1.0)
            + w.sla_weight * sla_score
            + w.bottleneck_weight * (1.0 - bottleneck_ratio.clamp(0.0, 1.0));
        (100.0 * weighted / total_weight).clamp(0.0, 100.0)
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxflow_core::definition::{Role, Stage, StageKind, WorkflowDefinition};

    fn counters(processed: u64, succeeded: u64, calls: u64) -> StageCounters {
        StageCounters {
            documents_processed: processed,
            documents_succeeded: succeeded,
            documents_failed: processed - succeeded,
            external_calls: calls,
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let parts = [counters(10, 9, 1), counters(4, 4, 2), counters(7, 1, 0)];
        let forward = MetricsAggregator::aggregate(parts.iter());
        let backward = MetricsAggregator::aggregate(parts.iter().rev());
        assert_eq!(forward, backward);
        assert_eq!(forward.documents_processed, 21);
        assert_eq!(forward.documents_failed, 7);

        // (a + b) + c == a + (b + c)
        let mut ab = MetricsAggregator::aggregate(&parts[..2]);
        ab.merge(&parts[2]);
        let mut a_bc = parts[0];
        a_bc.merge(&MetricsAggregator::aggregate(&parts[1..]));
        assert_eq!(ab, a_bc);
    }

    #[test]
    fn test_perfect_run_scores_100() {
        let agg = MetricsAggregator::default();
        assert_eq!(agg.performance_score(1.0, SlaStatus::OnTrack, 0.0), 100.0);
        assert_eq!(agg.performance_score(0.0, SlaStatus::Breached, 1.0), 0.0);
        let at_risk = agg.performance_score(1.0, SlaStatus::AtRisk, 0.0);
        assert!((at_risk - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_weights_are_normalized() {
        let agg = MetricsAggregator::new(ScoringConfig {
            success_weight: 2.0,
            sla_weight: 0.0,
            bottleneck_weight: 0.0,
        });
        assert!((agg.performance_score(0.5, SlaStatus::Breached, 1.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_from_execution() {
        let def = WorkflowDefinition::new("wf", "Metrics")
            .with_stage(Stage::new("a", "A", StageKind::Extraction, Role::SystemIntegration))
            .with_stage(Stage::new("b", "B", StageKind::Transmission, Role::Transmission))
            .with_stage(Stage::new("c", "C", StageKind::Acknowledgment, Role::Transmission));
        let mut exec = WorkflowExecution::new(&def, None);
        exec.stages[0].state = StageState::Completed;
        exec.stages[0].counters = counters(10, 8, 1);
        exec.stages[1].state = StageState::Failed;
        exec.stages[1].retry_count = 2;
        exec.stages[1].counters = counters(10, 2, 3);
        exec.stages[2].state = StageState::Skipped;

        let metrics = MetricsAggregator::default().compute(&exec, &[], SlaStatus::OnTrack);
        assert_eq!(metrics.documents_processed, 20);
        assert_eq!(metrics.documents_succeeded, 10);
        assert_eq!(metrics.external_calls, 4);
        assert_eq!(metrics.stages_completed, 1);
        assert_eq!(metrics.stages_failed, 1);
        assert_eq!(metrics.stages_skipped, 1);
        assert_eq!(metrics.total_retries, 2);
        // 0.5 * 0.5 + 0.3 + 0.2 = 0.75
        assert!((metrics.performance_score - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_stage_success_rate_without_documents() {
        let def = WorkflowDefinition::new("wf", "No docs")
            .with_stage(Stage::new("a", "A", StageKind::Custom, Role::SystemIntegration))
            .with_stage(Stage::new("b", "B", StageKind::Custom, Role::SystemIntegration));
        let mut exec = WorkflowExecution::new(&def, None);
        exec.stages[0].state = StageState::Completed;
        exec.stages[1].state = StageState::Failed;
        let metrics = MetricsAggregator::default().compute(&exec, &[], SlaStatus::OnTrack);
        assert!((metrics.performance_score - 75.0).abs() < 1e-9);
    }
}
