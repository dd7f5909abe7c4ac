//! Workflow definitions: stages, dependency edges, actions, triggers, and
//! error-handling rules. Definitions are shared read-only by every
//! execution instantiated from them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{expand_env_vars, RetryConfig};
use crate::error::{ErrorKind, Result, TaxflowError};

/// The role responsible for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Source-system integration: extraction, mapping, validation.
    SystemIntegration,
    /// Transmission and filing with the tax authority.
    Transmission,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SystemIntegration => f.write_str("system_integration"),
            Self::Transmission => f.write_str("transmission"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extraction,
    Validation,
    Transformation,
    Transmission,
    Acknowledgment,
    Custom,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Explicit dependency edges, in addition to each stage's `depends_on`.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Overall deadline measured from execution start.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

/// A dependency edge: `to` may not start before `from` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub from: String,
    pub to: String,
    /// Whether a skipped `from` satisfies `to`. `None` uses the engine default.
    #[serde(default)]
    pub skipped_satisfies: Option<bool>,
}

impl Dependency {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            skipped_satisfies: None,
        }
    }

    /// Require the upstream stage to actually complete.
    pub fn strict(mut self) -> Self {
        self.skipped_satisfies = Some(false);
        self
    }
}

/// A single unit of work owned by one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub kind: StageKind,
    pub role: Role,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Expected duration in seconds.
    #[serde(default)]
    pub expected_duration_secs: u64,
    /// Optional bound on the whole stage, across all of its actions.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub validation_rules: Vec<String>,
    #[serde(default)]
    pub error_handling: Vec<ErrorHandlingRule>,
    /// Compensating actions run when a downstream stage rolls back.
    #[serde(default)]
    pub compensation: Vec<Action>,
}

impl Stage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StageKind, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            role,
            permissions: vec![],
            expected_duration_secs: 0,
            timeout_secs: None,
            depends_on: vec![],
            actions: vec![],
            validation_rules: vec![],
            error_handling: vec![],
            compensation: vec![],
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_expected_duration(mut self, secs: u64) -> Self {
        self.expected_duration_secs = secs;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_rule(mut self, rule: ErrorHandlingRule) -> Self {
        self.error_handling.push(rule);
        self
    }

    pub fn with_compensation(mut self, action: Action) -> Self {
        self.compensation.push(action);
        self
    }
}

/// A typed unit of work inside a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_required() -> bool {
    true
}

fn default_action_timeout() -> u64 {
    30
}

/// Per-kind action configuration. Each variant carries only what it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    RemoteCall {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
    },
    DataTransform { mapping: String },
    Validation { rule_set: String },
    Notification {
        channel: String,
        #[serde(default)]
        recipients: Vec<String>,
    },
    ManualReview {
        reviewer: Role,
        #[serde(default)]
        instructions: String,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

impl ActionKind {
    /// Stable name of the variant, used for handler lookup and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoteCall { .. } => "remote_call",
            Self::DataTransform { .. } => "data_transform",
            Self::Validation { .. } => "validation",
            Self::Notification { .. } => "notification",
            Self::ManualReview { .. } => "manual_review",
        }
    }

    /// Check the variant's own fields. Returns human-readable problems.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self {
            Self::RemoteCall { endpoint, method } => {
                if endpoint.trim().is_empty() {
                    problems.push("remote_call endpoint is empty".to_string());
                }
                if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "PATCH" | "DELETE") {
                    problems.push(format!("remote_call method '{}' is not supported", method));
                }
            }
            Self::DataTransform { mapping } => {
                if mapping.trim().is_empty() {
                    problems.push("data_transform mapping is empty".to_string());
                }
            }
            Self::Validation { rule_set } => {
                if rule_set.trim().is_empty() {
                    problems.push("validation rule_set is empty".to_string());
                }
            }
            Self::Notification { channel, .. } => {
                if channel.trim().is_empty() {
                    problems.push("notification channel is empty".to_string());
                }
            }
            Self::ManualReview { .. } => {}
        }
        problems
    }
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: id.into(),
            kind,
            required: true,
            timeout_secs: default_action_timeout(),
            retry: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Activation rule for starting an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Cron expression (seconds field included).
    Schedule { cron: String },
    /// Fires when an external event of this type is reported.
    Event { event_type: String },
    /// Fires when the expression holds against reported context data.
    Condition { expr: String },
    Manual,
}

/// What to do when a stage fails with a matching error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Retry,
    Skip,
    Pause,
    Escalate,
    Rollback,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub channel: String,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingRule {
    /// Matches this error type only. `None` matches any type.
    #[serde(default)]
    pub error_type: Option<ErrorKind>,
    /// Regex the failure message must match, if set.
    #[serde(default)]
    pub message_pattern: Option<String>,
    pub response: ResponseAction,
    /// Retry bound for `retry` responses.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub escalate_to: Vec<Role>,
    #[serde(default)]
    pub notification: Option<NotificationConfig>,
}

impl ErrorHandlingRule {
    pub fn new(error_type: Option<ErrorKind>, response: ResponseAction) -> Self {
        Self {
            error_type,
            message_pattern: None,
            response,
            retry: None,
            escalate_to: vec![],
            notification: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.message_pattern = Some(pattern.into());
        self
    }

    pub fn escalate_to(mut self, roles: Vec<Role>) -> Self {
        self.escalate_to = roles;
        self
    }
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            stages: vec![],
            dependencies: vec![],
            triggers: vec![],
            deadline_secs: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_deadline(mut self, secs: u64) -> Self {
        self.deadline_secs = Some(secs);
        self
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// All dependency edges: explicit ones first, then each stage's
    /// `depends_on`, without duplicates.
    pub fn edges(&self) -> Vec<Dependency> {
        let mut edges = self.dependencies.clone();
        for stage in &self.stages {
            for dep in &stage.depends_on {
                let exists = edges.iter().any(|e| e.from == *dep && e.to == stage.id);
                if !exists {
                    edges.push(Dependency::new(dep.clone(), stage.id.clone()));
                }
            }
        }
        edges
    }

    /// Load a definition from a `.json` or `.toml` file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TaxflowError::ConfigNotFound(path.display().to_string()))?;
        let expanded = expand_env_vars(&content);

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&expanded)?),
            _ => Ok(toml::from_str(&expanded)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_builder() {
        let stage = Stage::new("extract", "Extract invoices", StageKind::Extraction, Role::SystemIntegration)
            .with_permissions(vec!["erp.read".into()])
            .with_expected_duration(120)
            .depends_on(&["connect"]);

        assert_eq!(stage.id, "extract");
        assert_eq!(stage.permissions, vec!["erp.read"]);
        assert_eq!(stage.expected_duration_secs, 120);
        assert_eq!(stage.depends_on, vec!["connect"]);
        assert!(stage.timeout_secs.is_none());
    }

    #[test]
    fn test_edges_merge_without_duplicates() {
        let def = WorkflowDefinition::new("wf", "Filing")
            .with_stage(Stage::new("a", "A", StageKind::Extraction, Role::SystemIntegration))
            .with_stage(
                Stage::new("b", "B", StageKind::Validation, Role::SystemIntegration).depends_on(&["a"]),
            )
            .with_dependency(Dependency::new("a", "b").strict());

        let edges = def.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].skipped_satisfies, Some(false));
    }

    #[test]
    fn test_action_kind_checks() {
        let ok = ActionKind::RemoteCall {
            endpoint: "https://sdi.example/submit".into(),
            method: "POST".into(),
        };
        assert!(ok.check().is_empty());

        let bad = ActionKind::RemoteCall {
            endpoint: " ".into(),
            method: "FETCH".into(),
        };
        assert_eq!(bad.check().len(), 2);

        let bad = ActionKind::Notification {
            channel: String::new(),
            recipients: vec![],
        };
        assert_eq!(bad.check(), vec!["notification channel is empty"]);
    }

    #[test]
    fn test_action_serde_tagged() {
        let json = r#"{"id":"send","type":"remote_call","endpoint":"https://x/submit","required":false}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert!(!action.required);
        assert_eq!(action.timeout_secs, 30);
        assert_eq!(
            action.kind,
            ActionKind::RemoteCall {
                endpoint: "https://x/submit".into(),
                method: "POST".into()
            }
        );
        assert_eq!(action.kind.name(), "remote_call");
    }

    #[test]
    fn test_definition_from_toml() {
        let toml_str = r#"
id = "sdi-filing"
name = "SDI filing"
deadline_secs = 3600

[[stages]]
id = "extract"
name = "Extract"
kind = "extraction"
role = "system_integration"
permissions = ["erp.read"]
expected_duration_secs = 60

[[stages.actions]]
id = "pull"
type = "remote_call"
endpoint = "https://erp.example/invoices"
method = "GET"

[[stages]]
id = "transmit"
name = "Transmit"
kind = "transmission"
role = "transmission"
depends_on = ["extract"]

[[stages.error_handling]]
error_type = "action_timeout"
response = "retry"
retry = { max_attempts = 2, delay_seconds = 0.5 }

[[triggers]]
id = "nightly"
type = "schedule"
cron = "0 0 2 * * *"
"#;
        let def: WorkflowDefinition = toml::from_str(toml_str).unwrap();
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.deadline_secs, Some(3600));
        let transmit = def.stage("transmit").unwrap();
        assert_eq!(transmit.error_handling[0].response, ResponseAction::Retry);
        assert_eq!(transmit.error_handling[0].error_type, Some(ErrorKind::ActionTimeout));
        let retry = transmit.error_handling[0].retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert!(def.triggers[0].enabled);
        assert!(matches!(def.triggers[0].kind, TriggerKind::Schedule { .. }));
    }
}
