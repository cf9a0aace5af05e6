//! # rstflow-store
//!
//! Persistence layer for rstflow.
//!
//! This crate provides:
//! - The `Store`/`StoreTx` adapter traits consumed by the engine
//! - Live-row and history record types
//! - An in-process store with exclusive per-row locks
//! - A CRC-checked commit journal for crash recovery

pub mod adapter;
pub mod error;
pub mod journal;
pub mod memory;
pub mod records;

pub use adapter::{Store, StoreTx};
pub use error::StoreError;
pub use journal::{CommitRecord, FsyncPolicy, Journal};
pub use memory::{MemoryStore, MemoryTx, StoreConfig};
pub use records::{ExpiredRow, HistoryRecord, LiveUpdate, NewHistory, WorkflowRecord};
