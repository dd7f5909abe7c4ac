//! Retry and error-handling policy.
//!
//! Given a failed attempt, picks the first matching rule on the stage and
//! turns it into a decision for the engine. Unmatched failures escalate.

use std::time::Duration;

use tracing::debug;

use taxflow_core::config::RetryConfig;
use taxflow_core::definition::{
    Action, ErrorHandlingRule, NotificationConfig, ResponseAction, Role, Stage,
};
use taxflow_core::execution::StageFailure;

/// What the engine should do with a failed stage.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Re-dispatch after `delay` as attempt `next_attempt`.
    Retry { delay: Duration, next_attempt: u32 },
    Skip,
    Pause,
    Escalate {
        roles: Vec<Role>,
        notification: NotificationConfig,
    },
    Rollback,
}

#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    default_retry: RetryConfig,
}

impl ErrorPolicy {
    pub fn new(default_retry: RetryConfig) -> Self {
        Self { default_retry }
    }

    /// Decide how to handle `failure` after `retry_count` retries so far.
    pub fn decide(
        &self,
        stage: &Stage,
        failure: &StageFailure,
        retry_count: u32,
        failing_action: Option<&Action>,
    ) -> PolicyDecision {
        let rule = match_rule(&stage.error_handling, failure);

        if failure.fatal {
            debug!(stage_id = %stage.id, "Fatal failure, bypassing retry policy");
            return escalate(rule, stage);
        }

        let Some(rule) = rule else {
            return escalate(None, stage);
        };

        match rule.response {
            ResponseAction::Retry => {
                let config = rule
                    .retry
                    .as_ref()
                    .or_else(|| failing_action.and_then(|a| a.retry.as_ref()))
                    .unwrap_or(&self.default_retry);
                // retry_count + 1 attempts have run so far.
                if retry_count + 1 < config.max_attempts {
                    PolicyDecision::Retry {
                        delay: retry_delay(config, retry_count),
                        next_attempt: retry_count + 2,
                    }
                } else {
                    debug!(
                        stage_id = %stage.id,
                        max_attempts = config.max_attempts,
                        "Retries exhausted"
                    );
                    escalate(Some(rule), stage)
                }
            }
            ResponseAction::Skip => PolicyDecision::Skip,
            ResponseAction::Pause => PolicyDecision::Pause,
            ResponseAction::Escalate => escalate(Some(rule), stage),
            ResponseAction::Rollback => PolicyDecision::Rollback,
        }
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn escalate(rule: Option<&ErrorHandlingRule>, stage: &Stage) -> PolicyDecision {
    let roles = match rule {
        Some(r) if !r.escalate_to.is_empty() => r.escalate_to.clone(),
        _ => vec![stage.role],
    };
    let notification = rule
        .and_then(|r| r.notification.clone())
        .unwrap_or_else(|| NotificationConfig {
            channel: "escalation".to_string(),
            template: None,
        });
    PolicyDecision::Escalate { roles, notification }
}

/// First rule whose error type and message pattern both match.
pub fn match_rule<'a>(
    rules: &'a [ErrorHandlingRule],
    failure: &StageFailure,
) -> Option<&'a ErrorHandlingRule> {
    rules.iter().find(|rule| rule_matches(rule, failure))
}

pub fn rule_matches(rule: &ErrorHandlingRule, failure: &StageFailure) -> bool {
    if let Some(kind) = rule.error_type {
        if kind != failure.kind {
            return false;
        }
    }
    match rule.message_pattern {
        Some(ref pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(&failure.message))
            .unwrap_or(false),
        None => true,
    }
}

/// Upper bound on any single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(86_400);

/// Delay before the retry that follows `retry_count` earlier retries:
/// `delay_seconds * multiplier^retry_count`, capped at `max_delay_seconds`
/// and at [`MAX_RETRY_DELAY`].
pub fn retry_delay(config: &RetryConfig, retry_count: u32) -> Duration {
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let secs = config.delay_seconds * config.backoff_multiplier.powi(exponent);
    let capped = secs.min(config.max_delay_seconds);
    if capped.is_nan() || capped <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(capped)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxflow_core::definition::{ActionKind, StageKind};
    use taxflow_core::ErrorKind;

    fn retry_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            delay_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_delay_seconds: 5.0,
        }
    }

    fn stage_with(rule: ErrorHandlingRule) -> Stage {
        Stage::new("transmit", "Transmit", StageKind::Transmission, Role::Transmission).with_rule(rule)
    }

    #[test]
    fn test_retry_delay_backoff_and_cap() {
        let config = retry_config(10);
        assert_eq!(retry_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(&config, 3), Duration::from_secs(5));
        assert_eq!(retry_delay(&config, 30), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_delay_out_of_range_values() {
        let huge = RetryConfig {
            max_attempts: 3,
            delay_seconds: 1e300,
            backoff_multiplier: 2.0,
            max_delay_seconds: f64::INFINITY,
        };
        assert_eq!(retry_delay(&huge, 0), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(&huge, u32::MAX), MAX_RETRY_DELAY);

        let nan = RetryConfig {
            delay_seconds: f64::NAN,
            max_delay_seconds: f64::NAN,
            ..retry_config(3)
        };
        assert_eq!(retry_delay(&nan, 1), Duration::ZERO);

        let negative = RetryConfig {
            delay_seconds: -4.0,
            ..retry_config(3)
        };
        assert_eq!(retry_delay(&negative, 0), Duration::ZERO);
    }

    #[test]
    fn test_retry_until_exhausted_then_escalate() {
        let stage = stage_with(
            ErrorHandlingRule::new(Some(ErrorKind::ActionFailed), ResponseAction::Retry)
                .with_retry(retry_config(3))
                .escalate_to(vec![Role::SystemIntegration]),
        );
        let policy = ErrorPolicy::default();
        let failure = StageFailure::new(ErrorKind::ActionFailed, "503");

        assert_eq!(
            policy.decide(&stage, &failure, 0, None),
            PolicyDecision::Retry {
                delay: Duration::from_secs(1),
                next_attempt: 2
            }
        );
        assert_eq!(
            policy.decide(&stage, &failure, 1, None),
            PolicyDecision::Retry {
                delay: Duration::from_secs(2),
                next_attempt: 3
            }
        );
        match policy.decide(&stage, &failure, 2, None) {
            PolicyDecision::Escalate { roles, .. } => {
                assert_eq!(roles, vec![Role::SystemIntegration])
            }
            other => panic!("expected escalate, got {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_defaults_to_escalate_stage_role() {
        let stage = stage_with(ErrorHandlingRule::new(
            Some(ErrorKind::ActionTimeout),
            ResponseAction::Retry,
        ));
        let decision = ErrorPolicy::default().decide(
            &stage,
            &StageFailure::new(ErrorKind::ValidationFailed, "bad VAT number"),
            0,
            None,
        );
        assert_eq!(
            decision,
            PolicyDecision::Escalate {
                roles: vec![Role::Transmission],
                notification: NotificationConfig {
                    channel: "escalation".into(),
                    template: None
                }
            }
        );
    }

    #[test]
    fn test_first_match_wins_with_pattern() {
        let stage = stage_with(
            ErrorHandlingRule::new(None, ResponseAction::Skip).with_pattern("^duplicate"),
        )
        .with_rule(ErrorHandlingRule::new(None, ResponseAction::Rollback));
        let policy = ErrorPolicy::default();

        let dup = StageFailure::new(ErrorKind::ActionFailed, "duplicate submission");
        assert_eq!(policy.decide(&stage, &dup, 0, None), PolicyDecision::Skip);

        let other = StageFailure::new(ErrorKind::ActionFailed, "rejected by SDI");
        assert_eq!(policy.decide(&stage, &other, 0, None), PolicyDecision::Rollback);
    }

    #[test]
    fn test_fatal_bypasses_retry() {
        let stage = stage_with(ErrorHandlingRule::new(None, ResponseAction::Retry));
        let failure = StageFailure::fatal(ErrorKind::ActionFailed, "no handler for remote_call");
        assert!(matches!(
            ErrorPolicy::default().decide(&stage, &failure, 0, None),
            PolicyDecision::Escalate { .. }
        ));
    }

    #[test]
    fn test_action_retry_config_used_when_rule_has_none() {
        let stage = stage_with(ErrorHandlingRule::new(None, ResponseAction::Retry));
        let action = Action::new(
            "send",
            ActionKind::RemoteCall {
                endpoint: "https://sdi.example".into(),
                method: "POST".into(),
            },
        )
        .with_retry(retry_config(1));
        let failure = StageFailure::new(ErrorKind::ActionFailed, "boom");

        // max_attempts = 1 means no retries at all
        assert!(matches!(
            ErrorPolicy::default().decide(&stage, &failure, 0, Some(&action)),
            PolicyDecision::Escalate { .. }
        ));
        // default config allows 3 attempts
        assert!(matches!(
            ErrorPolicy::default().decide(&stage, &failure, 0, None),
            PolicyDecision::Retry { next_attempt: 2, .. }
        ));
    }

    #[test]
    fn test_pause_response() {
        let stage = stage_with(ErrorHandlingRule::new(
            Some(ErrorKind::PermissionDenied),
            ResponseAction::Pause,
        ));
        let failure = StageFailure::new(ErrorKind::PermissionDenied, "missing sdi.submit");
        assert_eq!(
            ErrorPolicy::default().decide(&stage, &failure, 0, None),
            PolicyDecision::Pause
        );
    }
}
