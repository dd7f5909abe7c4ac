use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Data handed from completed stages to their dependents.
///
/// Keys are strings; values are JSON. Stage outputs are stored under the
/// producing stage's id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    data: HashMap<String, serde_json::Value>,
}

impl HandoffContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge a JSON payload: object fields become keys, anything else
    /// is stored under `fallback_key`.
    pub fn ingest(&mut self, fallback_key: &str, payload: &serde_json::Value) {
        match payload {
            serde_json::Value::Object(obj) => {
                for (k, v) in obj {
                    self.data.insert(k.clone(), v.clone());
                }
            }
            serde_json::Value::Null => {}
            other => {
                self.data.insert(fallback_key.to_string(), other.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }
}
