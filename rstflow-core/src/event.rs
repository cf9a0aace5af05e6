//! Events and workflow context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Workflow context: a plain key-value mapping shared by guards and actions.
pub type Context = Map<String, Value>;

/// An event delivered to a workflow instance.
///
/// Serializes flat, with the event type under `type`:
///
/// ```json
/// {"type": "PAY", "amount": 100}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event payload fields.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
        }
    }

    /// Adds a payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Looks up a dotted path. `type` resolves to the event type.
    pub fn field(&self, path: &str) -> Value {
        if path == "type" {
            return Value::String(self.event_type.clone());
        }
        lookup_path(&self.data, path)
    }

    /// Returns the event as a JSON value, as recorded in history.
    pub fn to_value(&self) -> Value {
        let mut map = self.data.clone();
        map.insert("type".to_string(), Value::String(self.event_type.clone()));
        Value::Object(map)
    }
}

/// Resolves a dotted path against a mapping. Missing segments yield `null`.
pub fn lookup_path(root: &Map<String, Value>, path: &str) -> Value {
    let mut parts = path.split('.');
    let mut current = match parts.next().and_then(|first| root.get(first)) {
        Some(v) => v,
        None => return Value::Null,
    };

    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }

    current.clone()
}
