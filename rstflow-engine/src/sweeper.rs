//! Timeout sweeper.
//!
//! Finds live rows whose expiry has passed and delivers the configured
//! timeout event to each through the regular dispatch path. A failed
//! instance is recorded and skipped; the sweep always runs to the end.

use crate::config::SweeperConfig;
use crate::manager::WorkflowManager;
use crate::metrics::Metrics;
use crate::notify::Notification;
use rstflow_core::Event;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// One instance whose timeout dispatch failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub type_name: String,
    pub id: String,
    pub error: String,
}

/// Statistics of one sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Registered types scanned.
    pub scanned: usize,
    pub expired_found: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
    /// Types whose expiry query failed.
    pub query_failures: usize,
    pub duration_ms: u64,
}

/// Periodically sweeps expired instances.
pub struct TimeoutSweeper {
    manager: Arc<WorkflowManager>,
    config: SweeperConfig,
    shutdown: AtomicBool,
    notify: Notify,
    last_report: parking_lot::Mutex<Option<SweepReport>>,
    metrics: Option<Arc<Metrics>>,
}

impl TimeoutSweeper {
    pub fn new(manager: Arc<WorkflowManager>, config: SweeperConfig) -> Self {
        Self {
            manager,
            config,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            last_report: parking_lot::Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one pass over every registered type.
    pub async fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let now = self.manager.clock().now();

        for type_name in self.manager.registry().type_names() {
            report.scanned += 1;

            let expired = match self.manager.store().find_expired(&type_name, now).await {
                Ok(rows) => rows,
                Err(e) => {
                    report.query_failures += 1;
                    tracing::error!(type_name = %type_name, error = %e, "expiry query failed");
                    continue;
                }
            };
            report.expired_found += expired.len();

            for row in expired {
                report.attempted += 1;
                let event = Event::new(self.config.timeout_event.as_str());

                match self.manager.dispatch(&type_name, &row.id, &event).await {
                    Ok(result) => {
                        report.succeeded += 1;
                        tracing::debug!(
                            type_name = %type_name,
                            instance_id = %row.id,
                            from = %row.state_value,
                            to = %result.state_value,
                            "timeout delivered"
                        );

                        let notification = Notification::TimeoutTriggered {
                            type_name: type_name.clone(),
                            instance_id: row.id.clone(),
                            state: row.state_value.clone(),
                            expired_at: row.expires_at,
                            timestamp: self.manager.clock().now(),
                        };
                        if let Err(e) = self.manager.sink().notify(notification) {
                            tracing::warn!(
                                type_name = %type_name,
                                instance_id = %row.id,
                                error = %e,
                                "timeout notification failed"
                            );
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            type_name = %type_name,
                            instance_id = %row.id,
                            code = e.error_code(),
                            error = %e,
                            "timeout dispatch failed"
                        );
                        report.failures.push(SweepFailure {
                            type_name: type_name.clone(),
                            id: row.id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(&report);
        }
        *self.last_report.lock() = Some(report.clone());
        report
    }

    /// Sweeps every interval until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        if !self.config.enabled {
            tracing::info!("Timeout sweeper is disabled");
            return;
        }

        tracing::info!(
            "Timeout sweeper started (interval_secs={}, timeout_event={})",
            self.config.interval_secs,
            self.config.timeout_event
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let report = self.sweep().await;
            if report.expired_found > 0 || report.query_failures > 0 {
                tracing::info!(
                    "Sweep complete: {} expired, {} succeeded, {} failed in {}ms",
                    report.expired_found,
                    report.succeeded,
                    report.failed,
                    report.duration_ms
                );
            } else {
                tracing::debug!("Sweep complete: nothing expired");
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        }

        tracing::info!("Timeout sweeper stopped");
    }

    /// Wakes the loop for an immediate sweep.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Signals the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Report of the most recent pass.
    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }
}
