//! Workflow manager.
//!
//! Runs one dispatch end-to-end inside a storage transaction:
//!
//! 1. resolve the type (before any transaction opens)
//! 2. lock the live row, hydrate a fresh [`Machine`] from its snapshot
//! 3. drive the event to quiescence
//! 4. upsert the live row with the settled state and derived expiry
//! 5. append one history row per realized transition
//! 6. commit, then notify
//!
//! Any failure before commit rolls the whole transaction back.

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::notify::{NoopSink, Notification, NotificationSink};
use chrono::{DateTime, Duration, Utc};
use rstflow_core::{
    CompiledWorkflow, Event, Machine, Registry, TransitionStep, DEFAULT_MAX_TRANSITION_DEPTH,
};
use rstflow_store::{HistoryRecord, LiveUpdate, NewHistory, Store, StoreTx, WorkflowRecord};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Settled view returned by a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub id: String,
    pub state_value: String,
    /// Persisted snapshot envelope.
    pub snapshot: Value,
    pub transition_count: usize,
    pub done: bool,
    pub transitions: Vec<TransitionStep>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A dispatch whose writes sit in an uncommitted transaction.
///
/// Hand it to [`WorkflowManager::publish`] once the transaction committed.
#[derive(Debug)]
#[must_use = "notifications are lost unless the dispatch is published after commit"]
pub struct PendingDispatch {
    result: DispatchResult,
    notifications: Vec<Notification>,
}

impl PendingDispatch {
    pub fn result(&self) -> &DispatchResult {
        &self.result
    }
}

/// Orchestrates dispatches against a store.
pub struct WorkflowManager {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    max_depth: u32,
    metrics: Option<Arc<Metrics>>,
}

impl WorkflowManager {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            sink: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            max_depth: DEFAULT_MAX_TRANSITION_DEPTH,
            metrics: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Delivers `event` to instance `instance_id` of `type_name`.
    ///
    /// Creates the instance on first sight. Concurrent dispatches for the
    /// same id serialize on its row lock.
    pub async fn dispatch(
        &self,
        type_name: &str,
        instance_id: &str,
        event: &Event,
    ) -> Result<DispatchResult, EngineError> {
        let workflow = self.registry.lookup(type_name)?;
        let started = Instant::now();

        let mut tx = self.store.begin().await?;
        let outcome = self
            .run(tx.as_mut(), type_name, &workflow, instance_id, event)
            .await;
        let pending = match outcome {
            Ok(pending) => pending,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                self.record(type_name, e.error_code(), started, 0);
                tracing::warn!(
                    type_name,
                    instance_id,
                    event = %event.event_type,
                    code = e.error_code(),
                    error = %e,
                    "dispatch failed, rolled back"
                );
                return Err(e);
            }
        };

        if let Err(e) = tx.commit().await {
            let e = EngineError::from(e);
            self.record(type_name, e.error_code(), started, 0);
            return Err(e);
        }

        self.record(type_name, "ok", started, pending.result.transition_count);
        tracing::info!(
            type_name,
            instance_id,
            event = %event.event_type,
            state = %pending.result.state_value,
            transitions = pending.result.transition_count,
            done = pending.result.done,
            "dispatch committed"
        );

        Ok(self.publish(pending))
    }

    /// Runs a dispatch inside a caller-owned transaction.
    ///
    /// Lets several dispatches share one transaction. The caller commits or
    /// rolls back, then passes the result to [`publish`](Self::publish).
    pub async fn dispatch_in(
        &self,
        tx: &mut dyn StoreTx,
        type_name: &str,
        instance_id: &str,
        event: &Event,
    ) -> Result<PendingDispatch, EngineError> {
        let workflow = self.registry.lookup(type_name)?;
        self.run(tx, type_name, &workflow, instance_id, event).await
    }

    /// Emits the notifications of a committed dispatch.
    ///
    /// Sink failures are logged and swallowed.
    pub fn publish(&self, pending: PendingDispatch) -> DispatchResult {
        for notification in pending.notifications {
            if let Err(e) = self.sink.notify(notification) {
                tracing::warn!(
                    instance_id = %pending.result.id,
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
        pending.result
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTx,
        type_name: &str,
        workflow: &Arc<CompiledWorkflow>,
        instance_id: &str,
        event: &Event,
    ) -> Result<PendingDispatch, EngineError> {
        let existing = tx.find_one_for_update(type_name, instance_id).await?;
        let is_new = existing.is_none();

        let mut machine = Machine::new(
            Arc::clone(workflow),
            existing.as_ref().map(|row| &row.snapshot),
            self.max_depth,
            instance_id,
        )?;
        let outcome = machine.dispatch(event).await?;

        let now = self.clock.now();
        let expires_at = self.expiry(workflow, &outcome.state, now);
        let snapshot = machine.snapshot().to_value();

        tx.upsert_live(
            type_name,
            instance_id,
            LiveUpdate {
                state_value: outcome.state.clone(),
                snapshot: snapshot.clone(),
                expires_at,
                at: now,
            },
        )
        .await?;

        let payload = event.to_value();
        for step in &outcome.transitions {
            tx.insert_history(
                type_name,
                NewHistory {
                    workflow_id: instance_id.to_string(),
                    from_state: step.from.clone(),
                    to_state: step.to.clone(),
                    event_type: event.event_type.clone(),
                    event_payload: payload.clone(),
                    transitioned_at: now,
                },
            )
            .await?;
        }

        let mut notifications = Vec::with_capacity(outcome.transitions.len() + 1);
        if is_new {
            notifications.push(Notification::Created {
                type_name: type_name.to_string(),
                instance_id: instance_id.to_string(),
                initial_state: workflow.initial.clone(),
                timestamp: now,
            });
        }
        notifications.extend(outcome.transitions.iter().map(|step| {
            Notification::Transitioned {
                type_name: type_name.to_string(),
                instance_id: instance_id.to_string(),
                from_state: step.from.clone(),
                to_state: step.to.clone(),
                event_type: event.event_type.clone(),
                event_payload: payload.clone(),
                timestamp: now,
            }
        }));

        Ok(PendingDispatch {
            result: DispatchResult {
                id: instance_id.to_string(),
                state_value: outcome.state,
                snapshot,
                transition_count: outcome.transitions.len(),
                done: outcome.done,
                transitions: outcome.transitions,
                expires_at,
            },
            notifications,
        })
    }

    /// Expiry of the settled state: `now + timeoutMinutes`, or none.
    fn expiry(
        &self,
        workflow: &CompiledWorkflow,
        state: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let minutes = workflow.timeout_minutes(state)?;
        let expiry = Duration::try_milliseconds((minutes * 60_000.0).round() as i64)
            .and_then(|timeout| now.checked_add_signed(timeout));
        if expiry.is_none() {
            tracing::warn!(state, minutes, "timeout out of range, instance will not expire");
        }
        expiry
    }

    fn record(&self, type_name: &str, outcome: &str, started: Instant, transitions: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(
                type_name,
                outcome,
                started.elapsed().as_secs_f64(),
                transitions,
            );
        }
    }

    /// Reads the committed live row of an instance.
    pub async fn get(
        &self,
        type_name: &str,
        instance_id: &str,
    ) -> Result<Option<WorkflowRecord>, EngineError> {
        self.registry.lookup(type_name)?;
        Ok(self.store.find_one(type_name, instance_id).await?)
    }

    /// Live rows currently in `state_value`.
    pub async fn find_by_state(
        &self,
        type_name: &str,
        state_value: &str,
    ) -> Result<Vec<WorkflowRecord>, EngineError> {
        self.registry.lookup(type_name)?;
        Ok(self.store.find_by_state(type_name, state_value).await?)
    }

    /// Transition history of an instance, oldest first.
    pub async fn history(
        &self,
        type_name: &str,
        instance_id: &str,
    ) -> Result<Vec<HistoryRecord>, EngineError> {
        self.registry.lookup(type_name)?;
        Ok(self.store.history(type_name, instance_id).await?)
    }
}
