//! Persisted row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The live row of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    /// Flattened state name, denormalized for queries.
    pub state_value: String,
    /// Snapshot envelope. Source of truth for the instance.
    pub snapshot: Value,
    /// Derived from the settled state's timeout.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One realized transition. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub from_state: String,
    pub to_state: String,
    pub event_type: String,
    pub event_payload: Value,
    pub transitioned_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal timestamps.
    pub sequence: u64,
}

/// Fields written by an upsert of the live row.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdate {
    pub state_value: String,
    pub snapshot: Value,
    pub expires_at: Option<DateTime<Utc>>,
    /// Update timestamp; also the creation timestamp of a new row.
    pub at: DateTime<Utc>,
}

/// Fields of a history row to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistory {
    pub workflow_id: String,
    pub from_state: String,
    pub to_state: String,
    pub event_type: String,
    pub event_payload: Value,
    pub transitioned_at: DateTime<Utc>,
}

/// A live row whose expiry has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredRow {
    pub id: String,
    /// State the row expired in.
    pub state_value: String,
    pub expires_at: DateTime<Utc>,
}
