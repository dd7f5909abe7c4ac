use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaxflowError};

/// Top-level Taxflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of stages in flight at once per execution.
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,
    /// Whether a skipped dependency satisfies readiness, for edges that do not say.
    #[serde(default = "default_skipped_satisfies")]
    pub skipped_satisfies_dependency: bool,
    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: default_max_concurrent_stages(),
            skipped_satisfies_dependency: default_skipped_satisfies(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_concurrent_stages() -> usize { 4 }
fn default_skipped_satisfies() -> bool { true }
fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Expected durations above this are flagged as unrealistic.
    #[serde(default = "default_max_expected_duration")]
    pub max_expected_duration_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_expected_duration_secs: default_max_expected_duration(),
        }
    }
}

fn default_max_expected_duration() -> u64 { 3600 }

/// Bottleneck and SLA thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Delay percentage above which a completed stage is a bottleneck.
    #[serde(default = "default_delay_threshold")]
    pub delay_threshold_pct: f64,
    /// Projected completion within this many seconds of the deadline is at risk.
    #[serde(default = "default_at_risk_margin")]
    pub at_risk_margin_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            delay_threshold_pct: default_delay_threshold(),
            at_risk_margin_secs: default_at_risk_margin(),
        }
    }
}

fn default_delay_threshold() -> f64 { 25.0 }
fn default_at_risk_margin() -> u64 { 300 }

/// Weights for the performance score. They are normalized before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    #[serde(default = "default_sla_weight")]
    pub sla_weight: f64,
    #[serde(default = "default_bottleneck_weight")]
    pub bottleneck_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            success_weight: default_success_weight(),
            sla_weight: default_sla_weight(),
            bottleneck_weight: default_bottleneck_weight(),
        }
    }
}

fn default_success_weight() -> f64 { 0.5 }
fn default_sla_weight() -> f64 { 0.3 }
fn default_bottleneck_weight() -> f64 { 0.2 }

/// Retry configuration for failed stages.
///
/// `max_attempts` counts every attempt, the initial run included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_seconds: default_delay_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_seconds: default_max_delay_seconds(),
        }
    }
}

impl RetryConfig {
    /// Problems that would make the retry schedule meaningless.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("retry max_attempts must be at least 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            problems.push("retry backoff_multiplier must be a finite number >= 1".to_string());
        }
        if !self.delay_seconds.is_finite() || self.delay_seconds < 0.0 {
            problems.push("retry delay_seconds must be a finite, non-negative number".to_string());
        }
        if !self.max_delay_seconds.is_finite() {
            problems.push("retry max_delay_seconds must be finite".to_string());
        } else if self.max_delay_seconds < self.delay_seconds {
            problems.push("retry max_delay_seconds is below delay_seconds".to_string());
        }
        problems
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_delay_seconds() -> f64 { 1.0 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay_seconds() -> f64 { 60.0 }

/// Simulated action behaviour for the CLI runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Probability in [0, 1] that an action fails.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default = "default_documents_per_action")]
    pub documents_per_action: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            failure_rate: 0.0,
            documents_per_action: default_documents_per_action(),
        }
    }
}

fn default_latency_ms() -> u64 { 200 }
fn default_documents_per_action() -> u64 { 10 }

/// JSONL event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(self.log_dir.as_deref().unwrap_or("logs"))
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TaxflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TaxflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn check(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.engine.event_capacity == 0 {
            problems.push("[engine] event_capacity must be at least 1".to_string());
        }
        problems.extend(self.retry.problems().into_iter().map(|p| format!("[retry] {}", p)));
        if let Some(ref sim) = self.simulation {
            if !(0.0..=1.0).contains(&sim.failure_rate) {
                problems.push(format!(
                    "[simulation] failure_rate must be within 0 and 1, got {}",
                    sim.failure_rate
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(TaxflowError::Config(problems.join("; ")))
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
