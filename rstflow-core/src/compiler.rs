//! Transition compiler.
//!
//! Turns a [`WorkflowDefinition`] into per-state lookup tables. Declaration
//! order is preserved: it is the tie-break when several candidates match.

use crate::action::ActionRef;
use crate::definition::{TransitionRule, WorkflowDefinition};
use crate::event::Context;
use crate::guard::Guard;
use std::collections::HashMap;

/// A transition ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledTransition {
    /// Unique synthetic name, e.g. `picking:on:PICKED:0` or `a:always:1`.
    pub name: String,
    pub source: String,
    pub target: Option<String>,
    pub guard: Option<Guard>,
    pub actions: Vec<ActionRef>,
}

/// Lookup tables for one state.
#[derive(Debug, Clone, Default)]
pub struct CompiledState {
    pub is_final: bool,
    pub timeout_minutes: Option<f64>,
    pub on: HashMap<String, Vec<CompiledTransition>>,
    pub always: Vec<CompiledTransition>,
    pub entry: Vec<ActionRef>,
    pub exit: Vec<ActionRef>,
}

/// A compiled, immutable workflow shared by every dispatch of its type.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub id: String,
    pub initial: String,
    pub context: Context,
    states: HashMap<String, CompiledState>,
}

impl CompiledWorkflow {
    pub fn state(&self, name: &str) -> Option<&CompiledState> {
        self.states.get(name)
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn is_final(&self, name: &str) -> bool {
        self.state(name).map(|s| s.is_final).unwrap_or(false)
    }

    /// Timeout of a state in minutes, if it declares one.
    pub fn timeout_minutes(&self, name: &str) -> Option<f64> {
        self.state(name).and_then(|s| s.timeout_minutes)
    }

    /// Candidates for `event` in `state`, in declaration order.
    pub fn transitions_for(&self, state: &str, event: &str) -> &[CompiledTransition] {
        self.state(state)
            .and_then(|s| s.on.get(event))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Eventless candidates for `state`, in declaration order.
    pub fn always_for(&self, state: &str) -> &[CompiledTransition] {
        self.state(state).map(|s| s.always.as_slice()).unwrap_or(&[])
    }

    /// Returns all state names.
    pub fn state_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.states.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Compiles a definition. Pure and deterministic; validate first.
pub fn compile(definition: &WorkflowDefinition) -> CompiledWorkflow {
    let states = definition
        .states
        .iter()
        .map(|(name, state)| {
            let on = state
                .on
                .iter()
                .map(|(event, rules)| {
                    let prefix = format!("{}:on:{}", name, event);
                    (event.clone(), compile_rules(name, &prefix, rules))
                })
                .collect();

            let compiled = CompiledState {
                is_final: state.is_final,
                timeout_minutes: state.timeout_minutes,
                on,
                always: compile_rules(name, &format!("{}:always", name), &state.always),
                entry: state.entry.clone(),
                exit: state.exit.clone(),
            };
            (name.clone(), compiled)
        })
        .collect();

    CompiledWorkflow {
        id: definition.id.clone(),
        initial: definition.initial.clone(),
        context: definition.context.clone(),
        states,
    }
}

fn compile_rules(source: &str, prefix: &str, rules: &[TransitionRule]) -> Vec<CompiledTransition> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| CompiledTransition {
            name: format!("{}:{}", prefix, i),
            source: source.to_string(),
            target: rule.target.clone(),
            guard: rule.guard.clone(),
            actions: rule.actions.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateDefinition;
    use std::collections::HashSet;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "a")
            .state(
                "a",
                StateDefinition::new()
                    .on("GO", TransitionRule::to("b").guard(Guard::expr("ctx.fast").unwrap()))
                    .on("GO", "c")
                    .always(TransitionRule::internal()),
            )
            .state("b", StateDefinition::new().timeout_minutes(5.0))
            .state("c", StateDefinition::final_state())
    }

    #[test]
    fn test_preserves_declaration_order() {
        let compiled = compile(&definition());
        let go = compiled.transitions_for("a", "GO");
        assert_eq!(go.len(), 2);
        assert_eq!(go[0].target.as_deref(), Some("b"));
        assert!(go[0].guard.is_some());
        assert_eq!(go[1].target.as_deref(), Some("c"));
        assert_eq!(go[1].source, "a");
    }

    #[test]
    fn test_names_are_unique() {
        let compiled = compile(&definition());
        let mut names = HashSet::new();
        for state in compiled.state_names() {
            for t in compiled.always_for(state) {
                assert!(names.insert(t.name.clone()));
            }
            if let Some(s) = compiled.state(state) {
                for list in s.on.values() {
                    for t in list {
                        assert!(names.insert(t.name.clone()));
                    }
                }
            }
        }
        assert_eq!(names.len(), 3);
        assert!(names.contains("a:on:GO:0"));
        assert!(names.contains("a:always:0"));
    }

    #[test]
    fn test_lookups() {
        let compiled = compile(&definition());
        assert!(compiled.transitions_for("a", "NOPE").is_empty());
        assert!(compiled.transitions_for("missing", "GO").is_empty());
        assert!(compiled.is_final("c"));
        assert_eq!(compiled.timeout_minutes("b"), Some(5.0));
        assert_eq!(compiled.timeout_minutes("a"), None);
        assert_eq!(compiled.state_names(), vec!["a", "b", "c"]);
    }
}
