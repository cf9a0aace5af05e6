//! # rstflow-core
//!
//! Workflow engine core for rstflow.
//!
//! This crate provides:
//! - Workflow definition model, JSON/YAML parsing and validation
//! - Guard expressions and actions
//! - Transition compilation
//! - The FSM runtime and its quiescence algorithm
//! - The versioned snapshot envelope
//! - The workflow type registry

pub mod action;
pub mod compiler;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod machine;
pub mod registry;
pub mod snapshot;

pub use action::{action_fn, Action, ActionRef, ActionScope, ActionSpec};
pub use compiler::{compile, CompiledTransition, CompiledWorkflow};
pub use definition::{StateDefinition, TransitionRule, WorkflowDefinition, WorkflowDefinitionRaw};
pub use error::{ActionError, CoreError};
pub use event::{Context, Event};
pub use guard::{Guard, GuardExpr, GuardScope};
pub use machine::{DispatchOutcome, Machine, TransitionStep, DEFAULT_MAX_TRANSITION_DEPTH};
pub use registry::Registry;
pub use snapshot::{dehydrate, hydrate, SnapshotEnvelope, Status};
