//! # rstflow-engine
//!
//! Workflow manager for rstflow.
//!
//! This crate provides:
//! - Transactional dispatch of events to persisted instances
//! - The background timeout sweeper
//! - Post-commit notifications and subscriptions
//! - Definition loading, configuration and Prometheus metrics

pub mod clock;
pub mod config;
pub mod error;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, EngineConfig, MetricsConfig, StorageConfig, SweeperConfig};
pub use error::EngineError;
pub use manager::{DispatchResult, PendingDispatch, WorkflowManager};
pub use metrics::{run_metrics_server, Metrics};
pub use notify::{
    Broadcaster, EventFilter, NoopSink, Notification, NotificationSink, NotifyError, Subscription,
};
pub use sweeper::{SweepFailure, SweepReport, TimeoutSweeper};
