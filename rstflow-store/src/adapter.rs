//! Persistence adapter traits.
//!
//! A table holds the live rows and history rows of one workflow type.

use crate::error::StoreError;
use crate::records::{ExpiredRow, HistoryRecord, LiveUpdate, NewHistory, WorkflowRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage backend shared by the manager and the sweeper.
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Reads a committed live row without locking.
    async fn find_one(&self, table: &str, id: &str) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Live rows whose expiry is at or before `now`, oldest first.
    async fn find_expired(
        &self,
        table: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiredRow>, StoreError>;

    async fn find_by_state(
        &self,
        table: &str,
        state_value: &str,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// History of one instance ordered by `transitioned_at`, then insertion.
    async fn history(&self, table: &str, id: &str) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// An open transaction.
///
/// Nested steps share a transaction by receiving the same `&mut dyn StoreTx`.
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Reads a live row and holds its exclusive lock until the transaction ends.
    ///
    /// The lock is taken even when the row does not exist yet, so two
    /// creators of the same id serialize.
    async fn find_one_for_update(
        &mut self,
        table: &str,
        id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError>;

    async fn upsert_live(
        &mut self,
        table: &str,
        id: &str,
        update: LiveUpdate,
    ) -> Result<WorkflowRecord, StoreError>;

    async fn insert_history(
        &mut self,
        table: &str,
        entry: NewHistory,
    ) -> Result<HistoryRecord, StoreError>;

    /// Makes every write of the transaction visible at once.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discards every write of the transaction.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
