//! Condition expressions for condition triggers.
//!
//! Supported forms, evaluated against a `HandoffContext`:
//! - `key == "value"` / `key != "value"`
//! - `key contains "substr"`
//! - `key > 10`, `key >= 10`, `key < 10`, `key <= 10` (numeric)

use taxflow_core::HandoffContext;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: String,
    pub op: Operator,
    pub value: String,
}

const OPERATORS: &[(&str, Operator)] = &[
    ("contains", Operator::Contains),
    ("!=", Operator::Ne),
    ("==", Operator::Eq),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
];

/// Parse `key OP value`. Returns `None` for anything else.
///
/// The key is the first whitespace-delimited token and the operator the
/// second, so operator text inside the key or the value is never matched.
pub fn parse_condition(expr: &str) -> Option<Condition> {
    let (key, rest) = expr.trim().split_once(char::is_whitespace)?;
    let (token, raw) = rest
        .trim_start()
        .split_once(char::is_whitespace)
        .map(|(token, raw)| (token, raw.trim()))?;
    let op = OPERATORS
        .iter()
        .find(|(t, _)| *t == token)
        .map(|(_, op)| *op)?;
    if raw.is_empty() {
        return None;
    }
    let value = unquote(raw);
    if matches!(op, Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le)
        && value.parse::<f64>().is_err()
    {
        return None;
    }
    Some(Condition {
        key: key.to_string(),
        op,
        value: value.to_string(),
    })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

impl Condition {
    pub fn evaluate(&self, context: &HandoffContext) -> bool {
        let Some(actual) = context.get(&self.key) else {
            return false;
        };
        let text = match actual {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self.op {
            Operator::Eq => text == self.value,
            Operator::Ne => text != self.value,
            Operator::Contains => text.contains(&self.value),
            Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
                let (Some(lhs), Ok(rhs)) = (as_number(actual), self.value.parse::<f64>()) else {
                    return false;
                };
                match self.op {
                    Operator::Gt => lhs > rhs,
                    Operator::Ge => lhs >= rhs,
                    Operator::Lt => lhs < rhs,
                    _ => lhs <= rhs,
                }
            }
        }
    }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Evaluate an expression; unparsable expressions are false.
pub fn evaluate_condition(expr: &str, context: &HandoffContext) -> bool {
    parse_condition(expr).is_some_and(|c| c.evaluate(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HandoffContext {
        let mut ctx = HandoffContext::new();
        ctx.set_str("status", "ready");
        ctx.set_str("note", "batch exported to SDI");
        ctx.set("pending_invoices", serde_json::json!(120));
        ctx
    }

    #[test]
    fn test_equals_and_not_equals() {
        assert!(evaluate_condition(r#"status == "ready""#, &ctx()));
        assert!(!evaluate_condition(r#"status == "blocked""#, &ctx()));
        assert!(evaluate_condition(r#"status != "blocked""#, &ctx()));
        assert!(evaluate_condition("pending_invoices == 120", &ctx()));
    }

    #[test]
    fn test_contains() {
        assert!(evaluate_condition(r#"note contains "SDI""#, &ctx()));
        assert!(!evaluate_condition(r#"note contains "PEC""#, &ctx()));
    }

    #[test]
    fn test_numeric() {
        assert!(evaluate_condition("pending_invoices > 100", &ctx()));
        assert!(evaluate_condition("pending_invoices >= 120", &ctx()));
        assert!(!evaluate_condition("pending_invoices < 100", &ctx()));
        assert!(evaluate_condition("pending_invoices <= 120", &ctx()));
        assert!(!evaluate_condition("status > 3", &ctx()));
    }

    #[test]
    fn test_missing_key_and_invalid() {
        assert!(!evaluate_condition(r#"missing == "x""#, &ctx()));
        assert!(parse_condition("this is not valid").is_none());
        assert!(parse_condition("count > lots").is_none());
        assert!(!evaluate_condition("this is not valid", &ctx()));
        assert!(parse_condition("status==\"ready\"").is_none());
        assert!(parse_condition("status ==").is_none());
    }

    #[test]
    fn test_operator_text_inside_key_is_part_of_key() {
        let parsed = parse_condition(r#"doc_contains_vat == "yes""#).unwrap();
        assert_eq!(parsed.key, "doc_contains_vat");
        assert_eq!(parsed.op, Operator::Eq);
        assert_eq!(parsed.value, "yes");

        let mut ctx = HandoffContext::new();
        ctx.set_str("doc_contains_vat", "yes");
        assert!(evaluate_condition(r#"doc_contains_vat == "yes""#, &ctx));
        ctx.set("net>gross_count", serde_json::json!(3));
        assert!(evaluate_condition("net>gross_count >= 2", &ctx));
    }

    #[test]
    fn test_operator_text_inside_value_is_kept() {
        let parsed = parse_condition(r#"status == "a!=b""#).unwrap();
        assert_eq!(parsed.op, Operator::Eq);
        assert_eq!(parsed.value, "a!=b");

        let mut ctx = HandoffContext::new();
        ctx.set_str("status", "a!=b");
        assert!(evaluate_condition(r#"status == "a!=b""#, &ctx));
        ctx.set_str("note", "sent to the authority");
        assert!(evaluate_condition(r#"note contains "to the""#, &ctx));
        assert!(evaluate_condition(r#"note != "a == b""#, &ctx));
    }

    #[test]
    fn test_empty_quoted_value() {
        let mut ctx = HandoffContext::new();
        ctx.set_str("reference", "");
        assert!(evaluate_condition(r#"reference == """#, &ctx));
    }
}
