//! In-process store with per-row locks and an optional commit journal.

use crate::adapter::{Store, StoreTx};
use crate::error::StoreError;
use crate::journal::{CommitRecord, FsyncPolicy, HistoryEntry, Journal, LiveEntry};
use crate::records::{ExpiredRow, HistoryRecord, LiveUpdate, NewHistory, WorkflowRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

type RowKey = (String, String);
type RowLock = Arc<tokio::sync::Mutex<()>>;

/// Store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Journal file; `None` keeps everything in memory only.
    pub journal_path: Option<PathBuf>,
    pub fsync_policy: FsyncPolicy,
    /// Maximum wait for a row lock; `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn journaled(path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
struct Table {
    live: HashMap<String, WorkflowRecord>,
    history: Vec<HistoryRecord>,
}

struct Inner {
    tables: RwLock<HashMap<String, Table>>,
    row_locks: Mutex<HashMap<RowKey, RowLock>>,
    journal: Option<Mutex<Journal>>,
    lock_timeout: Option<Duration>,
    history_sequence: AtomicU64,
}

impl Inner {
    fn committed(&self, table: &str, id: &str) -> Option<WorkflowRecord> {
        self.tables
            .read()
            .get(table)
            .and_then(|t| t.live.get(id))
            .cloned()
    }

    fn apply(&self, commit: CommitRecord) {
        let mut tables = self.tables.write();
        for entry in commit.live {
            tables
                .entry(entry.table)
                .or_default()
                .live
                .insert(entry.record.id.clone(), entry.record);
        }
        for entry in commit.history {
            tables.entry(entry.table).or_default().history.push(entry.record);
        }
    }

    fn row_lock(&self, key: &RowKey) -> RowLock {
        let mut locks = self.row_locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drops the lock entry once nobody holds or waits on it.
    fn release(&self, key: &RowKey, guard: OwnedMutexGuard<()>) {
        let lock = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);
        let mut locks = self.row_locks.lock();
        // map + the clone above
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}

/// Row-locked store kept in memory, optionally backed by a journal.
///
/// Writes are buffered in the transaction and applied on commit, so readers
/// never observe a partial dispatch.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty, non-durable store.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Opens a store, replaying its journal if one is configured.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let journal = match &config.journal_path {
            Some(path) => {
                let (journal, replay) = Journal::open(path, config.fsync_policy)?;
                Some((journal, replay))
            }
            None => None,
        };

        let (journal, commits) = match journal {
            Some((journal, replay)) => (Some(journal), replay.commits),
            None => (None, Vec::new()),
        };

        let store = Self::build(journal, config.lock_timeout);
        let mut max_sequence = 0;
        for commit in commits {
            for entry in &commit.history {
                max_sequence = max_sequence.max(entry.record.sequence);
            }
            store.inner.apply(commit);
        }
        store
            .inner
            .history_sequence
            .store(max_sequence + 1, Ordering::SeqCst);

        Ok(store)
    }

    fn build(journal: Option<Journal>, lock_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(HashMap::new()),
                row_locks: Mutex::new(HashMap::new()),
                journal: journal.map(Mutex::new),
                lock_timeout,
                history_sequence: AtomicU64::new(1),
            }),
        }
    }

    /// Number of live rows in `table`.
    pub fn live_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(table)
            .map(|t| t.live.len())
            .unwrap_or(0)
    }

    pub fn is_journaled(&self) -> bool {
        self.inner.journal.is_some()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            locks: HashMap::new(),
            live: HashMap::new(),
            history: Vec::new(),
        }))
    }

    async fn find_one(&self, table: &str, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.inner.committed(table, id))
    }

    async fn find_expired(
        &self,
        table: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiredRow>, StoreError> {
        let tables = self.inner.tables.read();
        let mut rows: Vec<ExpiredRow> = tables
            .get(table)
            .map(|t| {
                t.live
                    .values()
                    .filter_map(|r| match r.expires_at {
                        Some(at) if at <= now => Some(ExpiredRow {
                            id: r.id.clone(),
                            state_value: r.state_value.clone(),
                            expires_at: at,
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn find_by_state(
        &self,
        table: &str,
        state_value: &str,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let tables = self.inner.tables.read();
        let mut rows: Vec<WorkflowRecord> = tables
            .get(table)
            .map(|t| {
                t.live
                    .values()
                    .filter(|r| r.state_value == state_value)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn history(&self, table: &str, id: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let tables = self.inner.tables.read();
        let mut rows: Vec<HistoryRecord> = tables
            .get(table)
            .map(|t| {
                t.history
                    .iter()
                    .filter(|h| h.workflow_id == id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.transitioned_at
                .cmp(&b.transitioned_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(rows)
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTx {
    inner: Arc<Inner>,
    locks: HashMap<RowKey, OwnedMutexGuard<()>>,
    live: HashMap<RowKey, WorkflowRecord>,
    history: Vec<HistoryEntry>,
}

impl MemoryTx {
    async fn lock_row(&mut self, table: &str, id: &str) -> Result<(), StoreError> {
        let key = (table.to_string(), id.to_string());
        if self.locks.contains_key(&key) {
            return Ok(());
        }

        let lock = self.inner.row_lock(&key);
        let started = Instant::now();
        let guard = match self.inner.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout {
                    table: table.to_string(),
                    id: id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })?,
            None => lock.lock_owned().await,
        };

        tracing::trace!(table, id, "row lock acquired");
        self.locks.insert(key, guard);
        Ok(())
    }

    fn release_all(&mut self) {
        for (key, guard) in self.locks.drain() {
            self.inner.release(&key, guard);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_one_for_update(
        &mut self,
        table: &str,
        id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError> {
        self.lock_row(table, id).await?;
        let key = (table.to_string(), id.to_string());
        Ok(match self.live.get(&key) {
            Some(pending) => Some(pending.clone()),
            None => self.inner.committed(table, id),
        })
    }

    async fn upsert_live(
        &mut self,
        table: &str,
        id: &str,
        update: LiveUpdate,
    ) -> Result<WorkflowRecord, StoreError> {
        self.lock_row(table, id).await?;
        let key = (table.to_string(), id.to_string());

        let created_at = self
            .live
            .get(&key)
            .map(|r| r.created_at)
            .or_else(|| self.inner.committed(table, id).map(|r| r.created_at))
            .unwrap_or(update.at);

        let record = WorkflowRecord {
            id: id.to_string(),
            state_value: update.state_value,
            snapshot: update.snapshot,
            expires_at: update.expires_at,
            created_at,
            updated_at: update.at,
        };
        self.live.insert(key, record.clone());
        Ok(record)
    }

    async fn insert_history(
        &mut self,
        table: &str,
        entry: NewHistory,
    ) -> Result<HistoryRecord, StoreError> {
        let record = HistoryRecord {
            id: Uuid::new_v4(),
            workflow_id: entry.workflow_id,
            from_state: entry.from_state,
            to_state: entry.to_state,
            event_type: entry.event_type,
            event_payload: entry.event_payload,
            transitioned_at: entry.transitioned_at,
            sequence: self.inner.history_sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.history.push(HistoryEntry {
            table: table.to_string(),
            record: record.clone(),
        });
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        let commit = CommitRecord {
            live: this
                .live
                .drain()
                .map(|((table, _), record)| LiveEntry { table, record })
                .collect(),
            history: std::mem::take(&mut this.history),
        };

        if !commit.is_empty() {
            if let Some(journal) = &this.inner.journal {
                journal.lock().append(&commit)?;
            }
            tracing::trace!(
                live = commit.live.len(),
                history = commit.history.len(),
                "transaction committed"
            );
            this.inner.apply(commit);
        }

        this.release_all();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.live.clear();
        this.history.clear();
        this.release_all();
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.live.is_empty() || !self.history.is_empty() {
            tracing::debug!(
                live = self.live.len(),
                history = self.history.len(),
                "transaction dropped without commit, rolling back"
            );
        }
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::tempdir;

    fn update(state: &str, at: DateTime<Utc>) -> LiveUpdate {
        LiveUpdate {
            state_value: state.to_string(),
            snapshot: json!({"state": state}),
            expires_at: None,
            at,
        }
    }

    fn hop(id: &str, from: &str, to: &str, at: DateTime<Utc>) -> NewHistory {
        NewHistory {
            workflow_id: id.to_string(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            event_type: "GO".to_string(),
            event_payload: json!({"type": "GO"}),
            transitioned_at: at,
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.find_one_for_update("order", "o-1").await.unwrap().is_none());
        tx.upsert_live("order", "o-1", update("picking", now)).await.unwrap();
        tx.insert_history("order", hop("o-1", "idle", "picking", now))
            .await
            .unwrap();

        // uncommitted writes are invisible outside the transaction
        assert!(store.find_one("order", "o-1").await.unwrap().is_none());
        // but visible inside it
        let pending = tx.find_one_for_update("order", "o-1").await.unwrap().unwrap();
        assert_eq!(pending.state_value, "picking");

        tx.commit().await.unwrap();

        let row = store.find_one("order", "o-1").await.unwrap().unwrap();
        assert_eq!(row.state_value, "picking");
        assert_eq!(row.created_at, now);
        assert_eq!(store.history("order", "o-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.upsert_live("order", "o-1", update("picking", now)).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert_live("order", "o-1", update("picking", now)).await.unwrap();
            tx.insert_history("order", hop("o-1", "idle", "picking", now))
                .await
                .unwrap();
        }

        assert!(store.find_one("order", "o-1").await.unwrap().is_none());
        assert!(store.history("order", "o-1").await.unwrap().is_empty());

        // lock was released by the drop
        let mut tx = store.begin().await.unwrap();
        tx.find_one_for_update("order", "o-1").await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_created_at_preserved_on_update() {
        let store = MemoryStore::new();
        let first = Utc::now();
        let later = first + ChronoDuration::minutes(5);

        let mut tx = store.begin().await.unwrap();
        tx.upsert_live("order", "o-1", update("idle", first)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.find_one_for_update("order", "o-1").await.unwrap();
        tx.upsert_live("order", "o-1", update("picking", later)).await.unwrap();
        tx.commit().await.unwrap();

        let row = store.find_one("order", "o-1").await.unwrap().unwrap();
        assert_eq!(row.created_at, first);
        assert_eq!(row.updated_at, later);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let store = MemoryStore::open(
            StoreConfig::in_memory().with_lock_timeout(Duration::from_millis(20)),
        )
        .unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.find_one_for_update("order", "o-1").await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.find_one_for_update("order", "o-1").await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(err.is_retryable());

        // other rows are unaffected
        waiter.find_one_for_update("order", "o-2").await.unwrap();
        holder.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_sees_committed_state() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut first = store.begin().await.unwrap();
        first.find_one_for_update("order", "o-1").await.unwrap();

        let contender = store.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = contender.begin().await.unwrap();
            let seen = tx.find_one_for_update("order", "o-1").await.unwrap();
            tx.commit().await.unwrap();
            seen.map(|r| r.state_value)
        });

        tokio::task::yield_now().await;
        first.upsert_live("order", "o-1", update("picking", now)).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap().as_deref(), Some("picking"));
    }

    #[tokio::test]
    async fn test_queries() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        for (id, state, expiry) in [
            ("o-1", "picking", Some(now - ChronoDuration::minutes(1))),
            ("o-2", "picking", Some(now + ChronoDuration::minutes(10))),
            ("o-3", "packed", None),
            ("o-4", "picking", Some(now - ChronoDuration::minutes(5))),
        ] {
            let mut u = update(state, now);
            u.expires_at = expiry;
            tx.upsert_live("order", id, u).await.unwrap();
        }
        tx.commit().await.unwrap();

        let expired = store.find_expired("order", now).await.unwrap();
        let ids: Vec<&str> = expired.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["o-4", "o-1"]);

        let picking = store.find_by_state("order", "picking").await.unwrap();
        assert_eq!(picking.len(), 3);
        assert!(store.find_expired("shipment", now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_order() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.insert_history("order", hop("o-1", "A", "B", now)).await.unwrap();
        tx.insert_history("order", hop("o-1", "idle", "A", now - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        tx.insert_history("order", hop("o-1", "B", "C", now)).await.unwrap();
        tx.insert_history("order", hop("o-2", "idle", "A", now)).await.unwrap();
        tx.commit().await.unwrap();

        let hops: Vec<(String, String)> = store
            .history("order", "o-1")
            .await
            .unwrap()
            .into_iter()
            .map(|h| (h.from_state, h.to_state))
            .collect();
        assert_eq!(
            hops,
            vec![
                ("idle".to_string(), "A".to_string()),
                ("A".to_string(), "B".to_string()),
                ("B".to_string(), "C".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_journal_restores_state() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::journaled(dir.path().join("journal.log"));
        let now = Utc::now();

        {
            let store = MemoryStore::open(config.clone()).unwrap();
            assert!(store.is_journaled());
            let mut tx = store.begin().await.unwrap();
            tx.upsert_live("order", "o-1", update("picking", now)).await.unwrap();
            tx.insert_history("order", hop("o-1", "idle", "picking", now))
                .await
                .unwrap();
            tx.commit().await.unwrap();

            // rolled back work never reaches the journal
            let mut tx = store.begin().await.unwrap();
            tx.upsert_live("order", "o-1", update("packed", now)).await.unwrap();
            tx.rollback().await.unwrap();
        }

        let store = MemoryStore::open(config).unwrap();
        let row = store.find_one("order", "o-1").await.unwrap().unwrap();
        assert_eq!(row.state_value, "picking");
        let history = store.history("order", "o-1").await.unwrap();
        assert_eq!(history.len(), 1);

        // new history continues after the replayed sequence
        let mut tx = store.begin().await.unwrap();
        let next = tx
            .insert_history("order", hop("o-1", "picking", "packed", now))
            .await
            .unwrap();
        assert!(next.sequence > history[0].sequence);
    }
}
