//! Snapshot envelope codec.
//!
//! The envelope is the only persisted form of an instance's logical state:
//!
//! ```json
//! {
//!   "schema": "rstflow/snapshot",
//!   "version": 1,
//!   "engine": "rstflow-fsm",
//!   "state": "picking",
//!   "status": "active",
//!   "context": {"count": 2}
//! }
//! ```
//!
//! The engine tag is a compatibility discriminator. Envelopes written by a
//! different runtime are rejected, never reinterpreted.

use crate::compiler::CompiledWorkflow;
use crate::error::CoreError;
use crate::event::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema tag of the envelope.
pub const SNAPSHOT_SCHEMA: &str = "rstflow/snapshot";

/// Envelope version.
pub const SNAPSHOT_VERSION: u64 = 1;

/// Tag identifying this runtime implementation.
pub const ENGINE_TAG: &str = "rstflow-fsm";

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    /// Settled in a final state.
    Done,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Done => "done",
            Status::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Status::Active),
            "done" => Some(Status::Done),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

/// The V1 snapshot envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub schema: String,
    pub version: u64,
    pub engine: String,
    pub state: String,
    pub status: Status,
    pub context: Context,
}

impl SnapshotEnvelope {
    /// Returns the envelope as a JSON value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("schema".to_string(), Value::String(self.schema.clone()));
        map.insert("version".to_string(), Value::from(self.version));
        map.insert("engine".to_string(), Value::String(self.engine.clone()));
        map.insert("state".to_string(), Value::String(self.state.clone()));
        map.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        map.insert("context".to_string(), Value::Object(self.context.clone()));
        Value::Object(map)
    }
}

/// Runtime starting point restored from an envelope or from defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Hydrated {
    pub state: String,
    pub status: Status,
    pub context: Context,
}

/// Restores runtime state.
///
/// Without an envelope, seeds from the definition's initial state and a copy
/// of its default context.
pub fn hydrate(
    instance_id: &str,
    workflow: &CompiledWorkflow,
    envelope: Option<&Value>,
) -> Result<Hydrated, CoreError> {
    let envelope = match envelope {
        Some(envelope) => envelope,
        None => {
            let status = if workflow.is_final(&workflow.initial) {
                Status::Done
            } else {
                Status::Active
            };
            return Ok(Hydrated {
                state: workflow.initial.clone(),
                status,
                context: workflow.context.clone(),
            });
        }
    };

    let reject = |reason: String| CoreError::InvalidSnapshot {
        instance_id: instance_id.to_string(),
        reason,
    };

    let fields = envelope
        .as_object()
        .ok_or_else(|| reject("envelope is not an object".to_string()))?;

    match fields.get("schema").and_then(Value::as_str) {
        Some(SNAPSHOT_SCHEMA) => {}
        other => return Err(reject(format!("unsupported schema {:?}", other))),
    }

    match fields.get("version").and_then(Value::as_u64) {
        Some(SNAPSHOT_VERSION) => {}
        _ => {
            return Err(reject(format!(
                "unsupported version {}",
                fields.get("version").unwrap_or(&Value::Null)
            )))
        }
    }

    match fields.get("engine").and_then(Value::as_str) {
        Some(ENGINE_TAG) => {}
        other => {
            return Err(reject(format!(
                "engine mismatch: expected '{}', found {:?}",
                ENGINE_TAG, other
            )))
        }
    }

    let state = match fields.get("state").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s,
        _ => return Err(reject("state must be a non-empty string".to_string())),
    };
    if !workflow.has_state(state) {
        return Err(reject(format!("state '{}' not in definition", state)));
    }

    let context = match fields.get("context") {
        Some(Value::Object(map)) => map.clone(),
        _ => return Err(reject("context must be an object".to_string())),
    };

    let status = fields
        .get("status")
        .and_then(Value::as_str)
        .and_then(Status::parse)
        .ok_or_else(|| {
            reject(format!(
                "unrecognized status {}",
                fields.get("status").unwrap_or(&Value::Null)
            ))
        })?;

    Ok(Hydrated {
        state: state.to_string(),
        status,
        context,
    })
}

/// Packages runtime state with the fixed schema/version/engine tags.
pub fn dehydrate(state: &str, status: Status, context: &Context) -> SnapshotEnvelope {
    SnapshotEnvelope {
        schema: SNAPSHOT_SCHEMA.to_string(),
        version: SNAPSHOT_VERSION,
        engine: ENGINE_TAG.to_string(),
        state: state.to_string(),
        status,
        context: context.clone(),
    }
}
