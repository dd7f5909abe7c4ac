pub mod analyzer;
pub mod condition;
pub mod engine;
pub mod metrics;
pub mod policy;
pub mod run_log;
pub mod stage;
pub mod trigger;
pub mod validator;

pub use analyzer::BottleneckAnalyzer;
pub use engine::{ExecutionControl, ExecutionEngine, ExecutionHandle};
pub use metrics::MetricsAggregator;
pub use policy::{ErrorPolicy, PolicyDecision};
pub use run_log::RunLogger;
pub use stage::{StageExecutor, StageOutcome};
pub use trigger::TriggerScheduler;
pub use validator::{GraphValidator, ValidationReport};
