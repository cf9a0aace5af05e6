//! Workflow definition types.
//!
//! Definitions are built in code, with closures for guards and actions, or
//! parsed from a JSON/YAML document:
//!
//! ```json
//! {
//!   "id": "order",
//!   "initial": "idle",
//!   "context": {"count": 0},
//!   "states": {
//!     "idle": {"on": {"START": "picking"}},
//!     "picking": {
//!       "timeoutMinutes": 30,
//!       "on": {
//!         "TIMEOUT": "expired",
//!         "PICKED": [{"target": "packed", "guard": "ctx.items > 0"}]
//!       }
//!     },
//!     "packed": {"final": true},
//!     "expired": {"type": "final"}
//!   }
//! }
//! ```

use crate::action::{ActionRef, ActionSpec};
use crate::error::CoreError;
use crate::event::Context;
use crate::guard::Guard;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One candidate transition for an event (or for `always`).
#[derive(Debug, Clone, Default)]
pub struct TransitionRule {
    /// Target state. `None` runs the actions without changing state.
    pub target: Option<String>,
    pub guard: Option<Guard>,
    pub actions: Vec<ActionRef>,
}

impl TransitionRule {
    /// A rule moving to `target`.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    /// A target-less rule: runs its actions, state stays put.
    pub fn internal() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn action(mut self, action: ActionRef) -> Self {
        self.actions.push(action);
        self
    }
}

impl From<&str> for TransitionRule {
    fn from(target: &str) -> Self {
        Self::to(target)
    }
}

impl From<String> for TransitionRule {
    fn from(target: String) -> Self {
        Self::to(target)
    }
}

/// A single state.
#[derive(Debug, Clone, Default)]
pub struct StateDefinition {
    /// Terminal marker.
    pub is_final: bool,
    /// Minutes until the instance expires while settled in this state.
    pub timeout_minutes: Option<f64>,
    /// Event type -> candidate rules, tried in order.
    pub on: BTreeMap<String, Vec<TransitionRule>>,
    /// Eventless rules, tried in order after every transition.
    pub always: Vec<TransitionRule>,
    pub entry: Vec<ActionRef>,
    pub exit: Vec<ActionRef>,
    /// Child states. Hierarchical states are not supported; validation
    /// rejects any state that declares children.
    pub states: BTreeMap<String, StateDefinition>,
}

impl StateDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn final_state() -> Self {
        Self {
            is_final: true,
            ..Default::default()
        }
    }

    pub fn timeout_minutes(mut self, minutes: f64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    /// Appends a rule for `event`.
    pub fn on(mut self, event: impl Into<String>, rule: impl Into<TransitionRule>) -> Self {
        self.on.entry(event.into()).or_default().push(rule.into());
        self
    }

    /// Appends an eventless rule.
    pub fn always(mut self, rule: impl Into<TransitionRule>) -> Self {
        self.always.push(rule.into());
        self
    }

    pub fn entry(mut self, action: ActionRef) -> Self {
        self.entry.push(action);
        self
    }

    pub fn exit(mut self, action: ActionRef) -> Self {
        self.exit.push(action);
        self
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub initial: String,
    /// Default context for new instances.
    pub context: Context,
    pub states: BTreeMap<String, StateDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial: initial.into(),
            context: Context::new(),
            states: BTreeMap::new(),
        }
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn state(mut self, name: impl Into<String>, state: StateDefinition) -> Self {
        self.states.insert(name.into(), state);
        self
    }

    /// Checks that the definition is well-formed.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.initial.is_empty() {
            return Err(invalid("initial state must not be empty"));
        }
        if !self.states.contains_key(&self.initial) {
            return Err(invalid(format!(
                "initial state '{}' not in states",
                self.initial
            )));
        }

        for (name, state) in &self.states {
            if name.is_empty() {
                return Err(invalid("state names must not be empty"));
            }
            if !state.states.is_empty() {
                return Err(invalid(format!(
                    "state '{}' declares nested states, which are not supported",
                    name
                )));
            }
            if let Some(minutes) = state.timeout_minutes {
                if !minutes.is_finite() || minutes < 0.0 {
                    return Err(invalid(format!(
                        "state '{}' has invalid timeoutMinutes {}",
                        name, minutes
                    )));
                }
            }

            for (event, rules) in &state.on {
                if event.is_empty() {
                    return Err(invalid(format!("state '{}' has an empty event type", name)));
                }
                self.check_targets(name, rules)?;
            }
            self.check_targets(name, &state.always)?;
        }

        Ok(())
    }

    fn check_targets(&self, source: &str, rules: &[TransitionRule]) -> Result<(), CoreError> {
        for target in rules.iter().filter_map(|r| r.target.as_ref()) {
            if !self.states.contains_key(target) {
                return Err(invalid(format!(
                    "transition target '{}' from '{}' not in states",
                    target, source
                )));
            }
        }
        Ok(())
    }

    /// Returns true if `state` exists and is marked final.
    pub fn is_final(&self, state: &str) -> bool {
        self.states.get(state).map(|s| s.is_final).unwrap_or(false)
    }

    /// Parses a definition document from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: WorkflowDefinitionRaw =
            serde_json::from_value(json.clone()).map_err(|e| invalid(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Converts a parsed document. Guard expressions are parsed here.
    pub fn from_raw(raw: WorkflowDefinitionRaw) -> Result<Self, CoreError> {
        let states = raw
            .states
            .into_iter()
            .map(|(name, state)| Ok((name, state.into_state()?)))
            .collect::<Result<BTreeMap<_, _>, CoreError>>()?;

        Ok(Self {
            id: raw.id,
            initial: raw.initial,
            context: raw.context,
            states,
        })
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}

/// Definition document as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinitionRaw {
    /// Registry type name; loaders fall back to the file name.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub id: String,
    pub initial: String,
    #[serde(default)]
    pub context: Context,
    pub states: BTreeMap<String, StateDefinitionRaw>,
}

/// State as written in a definition document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateDefinitionRaw {
    #[serde(default, rename = "final")]
    pub is_final: bool,
    /// Legacy terminal marker: `type: final`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<f64>,
    #[serde(default)]
    pub on: BTreeMap<String, RulesRaw>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always: Option<RulesRaw>,
    #[serde(default)]
    pub entry: Vec<ActionSpec>,
    #[serde(default)]
    pub exit: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<String, StateDefinitionRaw>,
}

impl StateDefinitionRaw {
    fn into_state(self) -> Result<StateDefinition, CoreError> {
        let on = self
            .on
            .into_iter()
            .map(|(event, rules)| Ok((event, rules.into_rules()?)))
            .collect::<Result<BTreeMap<_, _>, CoreError>>()?;

        let always = match self.always {
            Some(rules) => rules.into_rules()?,
            None => Vec::new(),
        };

        let states = self
            .states
            .into_iter()
            .map(|(name, state)| Ok((name, state.into_state()?)))
            .collect::<Result<BTreeMap<_, _>, CoreError>>()?;

        Ok(StateDefinition {
            is_final: self.is_final || self.kind.as_deref() == Some("final"),
            timeout_minutes: self.timeout_minutes,
            on,
            always,
            entry: self.entry.into_iter().map(ActionSpec::into_action).collect(),
            exit: self.exit.into_iter().map(ActionSpec::into_action).collect(),
            states,
        })
    }
}

/// A single rule or an ordered list of rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RulesRaw {
    One(RuleRaw),
    Many(Vec<RuleRaw>),
}

impl RulesRaw {
    fn into_rules(self) -> Result<Vec<TransitionRule>, CoreError> {
        match self {
            RulesRaw::One(rule) => Ok(vec![rule.into_rule()?]),
            RulesRaw::Many(rules) => rules.into_iter().map(RuleRaw::into_rule).collect(),
        }
    }
}

/// A bare target name or a full rule object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRaw {
    Target(String),
    Full(RuleObjectRaw),
}

/// Rule object form: `{target, guard, actions}`, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleObjectRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl RuleRaw {
    fn into_rule(self) -> Result<TransitionRule, CoreError> {
        match self {
            RuleRaw::Target(target) => Ok(TransitionRule::to(target)),
            RuleRaw::Full(rule) => Ok(TransitionRule {
                target: rule.target,
                guard: rule.guard.as_deref().map(Guard::expr).transpose()?,
                actions: rule
                    .actions
                    .into_iter()
                    .map(ActionSpec::into_action)
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> serde_json::Value {
        json!({
            "id": "order",
            "initial": "idle",
            "context": {"count": 0},
            "states": {
                "idle": {"on": {"START": "picking"}},
                "picking": {
                    "timeoutMinutes": 30,
                    "on": {
                        "TIMEOUT": "expired",
                        "PICKED": [
                            {"target": "packed", "guard": "ctx.items > 0"},
                            {"actions": [{"increment": "misses"}]}
                        ]
                    }
                },
                "packed": {"final": true},
                "expired": {"type": "final"}
            }
        })
    }

    #[test]
    fn test_parse_definition() {
        let def = WorkflowDefinition::from_json(&sample_definition()).unwrap();
        def.validate().unwrap();

        assert_eq!(def.id, "order");
        assert_eq!(def.initial, "idle");
        assert_eq!(def.states.len(), 4);
        assert_eq!(def.context["count"], json!(0));

        let picking = &def.states["picking"];
        assert_eq!(picking.timeout_minutes, Some(30.0));
        let picked = &picking.on["PICKED"];
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].target.as_deref(), Some("packed"));
        assert!(picked[0].guard.is_some());
        assert!(picked[1].target.is_none());
        assert_eq!(picked[1].actions.len(), 1);

        assert!(def.is_final("packed"));
        assert!(def.is_final("expired"));
        assert!(!def.is_final("idle"));
    }

    #[test]
    fn test_parse_yaml_document() {
        let yaml = r#"
id: approval
initial: pending
states:
  pending:
    always:
      - target: approved
        guard: ctx.auto
  approved:
    final: true
"#;
        let raw: WorkflowDefinitionRaw = serde_yaml::from_str(yaml).unwrap();
        let def = WorkflowDefinition::from_raw(raw).unwrap();
        def.validate().unwrap();
        assert_eq!(def.states["pending"].always.len(), 1);
    }

    #[test]
    fn test_rejects_unknown_target() {
        let def = WorkflowDefinition::new("wf", "a")
            .state("a", StateDefinition::new().on("GO", "nowhere"))
            .state("b", StateDefinition::new());
        assert!(matches!(
            def.validate(),
            Err(CoreError::InvalidDefinition { .. })
        ));

        let def = WorkflowDefinition::new("wf", "a")
            .state("a", StateDefinition::new().always("nowhere"));
        assert!(matches!(
            def.validate(),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_initial_and_id() {
        let def = WorkflowDefinition::new("wf", "c").state("a", StateDefinition::new());
        assert!(def.validate().is_err());

        let def = WorkflowDefinition::new("", "a").state("a", StateDefinition::new());
        assert!(def.validate().is_err());

        let def = WorkflowDefinition::new("wf", "").state("a", StateDefinition::new());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_rejects_nested_states() {
        let json = json!({
            "id": "wf",
            "initial": "a",
            "states": {
                "a": {"states": {"inner": {}}}
            }
        });
        let def = WorkflowDefinition::from_json(&json).unwrap();
        assert!(matches!(
            def.validate(),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_rejects_negative_timeout() {
        let def = WorkflowDefinition::new("wf", "a")
            .state("a", StateDefinition::new().timeout_minutes(-1.0));
        assert!(def.validate().is_err());

        let def = WorkflowDefinition::new("wf", "a")
            .state("a", StateDefinition::new().timeout_minutes(f64::NAN));
        assert!(def.validate().is_err());

        let def = WorkflowDefinition::new("wf", "a")
            .state("a", StateDefinition::new().timeout_minutes(0.0));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_non_numeric_timeout_is_definition_error() {
        let json = json!({
            "id": "wf",
            "initial": "a",
            "states": {"a": {"timeoutMinutes": "soon"}}
        });
        assert!(matches!(
            WorkflowDefinition::from_json(&json),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_rejects_misspelled_keys() {
        let misspelled_rule = json!({
            "id": "wf",
            "initial": "a",
            "states": {
                "a": {"on": {"GO": {"targte": "b"}}},
                "b": {}
            }
        });
        assert!(matches!(
            WorkflowDefinition::from_json(&misspelled_rule),
            Err(CoreError::InvalidDefinition { .. })
        ));

        let snake_case_timeout = json!({
            "id": "wf",
            "initial": "a",
            "states": {"a": {"timeout_minutes": 30}}
        });
        assert!(matches!(
            WorkflowDefinition::from_json(&snake_case_timeout),
            Err(CoreError::InvalidDefinition { .. })
        ));

        let unknown_top_level = json!({
            "id": "wf",
            "initial": "a",
            "inital": "a",
            "states": {"a": {}}
        });
        assert!(WorkflowDefinition::from_json(&unknown_top_level).is_err());

        // the full rule object is still accepted
        let ok = json!({
            "id": "wf",
            "initial": "a",
            "states": {
                "a": {"on": {"GO": {"target": "b", "guard": "event.ok"}}},
                "b": {}
            }
        });
        let def = WorkflowDefinition::from_json(&ok).unwrap();
        assert_eq!(def.states["a"].on["GO"][0].target.as_deref(), Some("b"));
    }

    #[test]
    fn test_accepts_final_initial_state() {
        let def =
            WorkflowDefinition::new("wf", "done").state("done", StateDefinition::final_state());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_bad_guard_expression_fails_parse() {
        let json = json!({
            "id": "wf",
            "initial": "a",
            "states": {
                "a": {"on": {"GO": {"target": "a", "guard": "count > 1"}}}
            }
        });
        assert!(matches!(
            WorkflowDefinition::from_json(&json),
            Err(CoreError::InvalidGuard { .. })
        ));
    }
}
