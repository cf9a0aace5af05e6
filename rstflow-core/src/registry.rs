//! Workflow type registry.

use crate::compiler::{compile, CompiledWorkflow};
use crate::definition::WorkflowDefinition;
use crate::error::CoreError;
use dashmap::DashMap;
use std::sync::Arc;

/// Maps type names to compiled workflows.
///
/// Populated at startup. The persistence table of a type is its type name.
#[derive(Default)]
pub struct Registry {
    types: DashMap<String, Arc<CompiledWorkflow>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates, compiles and stores a definition under `type_name`.
    pub fn register(
        &self,
        type_name: impl Into<String>,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<CompiledWorkflow>, CoreError> {
        let type_name = type_name.into();
        if type_name.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "type name must not be empty".to_string(),
            });
        }

        definition.validate()?;
        let compiled = Arc::new(compile(definition));

        match self.types.entry(type_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CoreError::DuplicateType { type_name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&compiled));
                tracing::info!(
                    type_name = %type_name,
                    workflow = %definition.id,
                    states = definition.states.len(),
                    "registered workflow type"
                );
                Ok(compiled)
            }
        }
    }

    /// Returns the compiled workflow for `type_name`.
    pub fn lookup(&self, type_name: &str) -> Result<Arc<CompiledWorkflow>, CoreError> {
        self.types
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::TypeNotFound {
                type_name: type_name.to_string(),
            })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
