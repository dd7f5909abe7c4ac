//! Structural soundness checks for workflow definitions.
//!
//! Validation is pure: the same definition always yields the same report.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use taxflow_core::config::ValidationConfig;
use taxflow_core::definition::{Dependency, TriggerKind, WorkflowDefinition};

use crate::condition::parse_condition;

/// Outcome of validating a definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn has_cycle(&self) -> bool {
        self.errors.iter().any(|e| e.starts_with("circular dependency"))
    }
}

pub struct GraphValidator {
    config: ValidationConfig,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl GraphValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, def: &WorkflowDefinition) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let edges = known_edges(def, &mut errors);

        // 1. Cycles
        errors.extend(find_cycles(def, &edges));

        // 2. Isolated stages
        if def.stages.len() > 1 {
            for stage in &def.stages {
                let connected = edges.iter().any(|e| e.from == stage.id || e.to == stage.id);
                if !connected {
                    warnings.push(format!(
                        "Stage '{}' is isolated and will run disconnected from the rest of the flow",
                        stage.id
                    ));
                }
            }
        }

        for stage in &def.stages {
            // 3. Permissions
            if stage.permissions.is_empty() {
                warnings.push(format!("Stage '{}' has no required permissions", stage.id));
            }

            // 4. Durations
            if stage.expected_duration_secs > self.config.max_expected_duration_secs {
                warnings.push(format!(
                    "Stage '{}' expects {}s, above the {}s realistic maximum",
                    stage.id, stage.expected_duration_secs, self.config.max_expected_duration_secs
                ));
            } else if stage.expected_duration_secs == 0 {
                warnings.push(format!(
                    "Stage '{}' has no expected duration; bottleneck analysis is skipped for it",
                    stage.id
                ));
            }

            if stage.actions.is_empty() {
                warnings.push(format!("Stage '{}' has no actions", stage.id));
            }

            let mut action_ids = HashSet::new();
            for action in stage.actions.iter().chain(stage.compensation.iter()) {
                if !action_ids.insert(action.id.as_str()) {
                    errors.push(format!(
                        "Stage '{}' has duplicate action id '{}'",
                        stage.id, action.id
                    ));
                }
                for problem in action.kind.check() {
                    errors.push(format!("Stage '{}' action '{}': {}", stage.id, action.id, problem));
                }
                if action.timeout_secs == 0 {
                    errors.push(format!(
                        "Stage '{}' action '{}': timeout must be positive",
                        stage.id, action.id
                    ));
                }
                if let Some(ref retry) = action.retry {
                    for problem in retry.problems() {
                        errors.push(format!("Stage '{}' action '{}': {}", stage.id, action.id, problem));
                    }
                }
            }

            for (i, rule) in stage.error_handling.iter().enumerate() {
                if let Some(ref pattern) = rule.message_pattern {
                    if let Err(e) = regex::Regex::new(pattern) {
                        errors.push(format!(
                            "Stage '{}' rule {}: invalid message pattern: {}",
                            stage.id, i, e
                        ));
                    }
                }
                if let Some(ref retry) = rule.retry {
                    for problem in retry.problems() {
                        errors.push(format!("Stage '{}' rule {}: {}", stage.id, i, problem));
                    }
                }
            }
        }

        for trigger in &def.triggers {
            match &trigger.kind {
                TriggerKind::Schedule { cron } => {
                    if let Err(e) = cron::Schedule::from_str(cron) {
                        errors.push(format!(
                            "Trigger '{}': invalid cron expression '{}': {}",
                            trigger.id, cron, e
                        ));
                    }
                }
                TriggerKind::Condition { expr } => {
                    if parse_condition(expr).is_none() {
                        errors.push(format!(
                            "Trigger '{}': unparsable condition '{}'",
                            trigger.id, expr
                        ));
                    }
                }
                TriggerKind::Event { event_type } => {
                    if event_type.trim().is_empty() {
                        errors.push(format!("Trigger '{}': empty event type", trigger.id));
                    }
                }
                TriggerKind::Manual => {}
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

/// Check stage ids and edge endpoints, returning only edges between known stages.
fn known_edges(def: &WorkflowDefinition, errors: &mut Vec<String>) -> Vec<Dependency> {
    let mut seen = HashSet::new();
    for stage in &def.stages {
        if !seen.insert(stage.id.as_str()) {
            errors.push(format!("Duplicate stage id '{}'", stage.id));
        }
    }

    def.edges()
        .into_iter()
        .filter(|e| {
            let mut ok = true;
            for endpoint in [&e.from, &e.to] {
                if !seen.contains(endpoint.as_str()) {
                    errors.push(format!(
                        "Dependency {} -> {} references unknown stage '{}'",
                        e.from, e.to, endpoint
                    ));
                    ok = false;
                }
            }
            ok
        })
        .collect()
}

/// Depth-first search with a recursion stack; every back-edge is a cycle.
fn find_cycles(def: &WorkflowDefinition, edges: &[Dependency]) -> Vec<String> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges {
        adjacency.entry(e.from.as_str()).or_default().push(e.to.as_str());
    }

    let mut marks: HashMap<&str, Mark> = def
        .stages
        .iter()
        .map(|s| (s.id.as_str(), Mark::Unvisited))
        .collect();
    let mut stack = Vec::new();
    let mut cycles = Vec::new();

    for stage in &def.stages {
        if marks.get(stage.id.as_str()) == Some(&Mark::Unvisited) {
            visit(stage.id.as_str(), &adjacency, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

fn visit<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    cycles: &mut Vec<String>,
) {
    marks.insert(node, Mark::OnStack);
    stack.push(node);

    for &next in adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]) {
        match marks.get(next).copied().unwrap_or(Mark::Done) {
            Mark::Unvisited => visit(next, adjacency, marks, stack, cycles),
            Mark::OnStack => {
                let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                let mut path: Vec<&str> = stack[start..].to_vec();
                path.push(next);
                cycles.push(format!("circular dependency: {}", path.join(" -> ")));
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks.insert(node, Mark::Done);
}
