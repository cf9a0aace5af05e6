//! Transition and state actions.
//!
//! Actions run in the fixed order exit -> transition -> entry and are awaited
//! one at a time. They receive the instance context by mutable reference, so
//! every action in one dispatch sees the writes of the previous ones.

use crate::error::ActionError;
use crate::event::{lookup_path, Context, Event};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Inputs handed to an action.
pub struct ActionScope<'a> {
    pub context: &'a mut Context,
    pub event: &'a Event,
    pub from_state: &'a str,
    pub to_state: &'a str,
}

/// A side-effecting step run during a transition.
#[async_trait]
pub trait Action: Send + Sync {
    /// Runs the action.
    async fn execute(&self, scope: ActionScope<'_>) -> Result<(), ActionError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "action"
    }
}

/// Shared handle to an action.
pub type ActionRef = Arc<dyn Action>;

/// Wraps a synchronous closure as an action.
pub fn action_fn<F>(f: F) -> ActionRef
where
    F: Fn(ActionScope<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

struct FnAction<F>(F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(ActionScope<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
{
    async fn execute(&self, scope: ActionScope<'_>) -> Result<(), ActionError> {
        (self.0)(scope)
    }

    fn name(&self) -> &str {
        "fn"
    }
}

/// Declarative actions usable from JSON/YAML definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    /// Shallow-merges the given fields into the context.
    Assign(Map<String, Value>),
    /// Adds one to a numeric context field (missing counts as zero).
    Increment(String),
}

impl ActionSpec {
    pub fn into_action(self) -> ActionRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Action for ActionSpec {
    async fn execute(&self, scope: ActionScope<'_>) -> Result<(), ActionError> {
        match self {
            ActionSpec::Assign(fields) => {
                for (k, v) in fields {
                    scope.context.insert(k.clone(), v.clone());
                }
                Ok(())
            }
            ActionSpec::Increment(path) => increment(scope.context, path),
        }
    }

    fn name(&self) -> &str {
        match self {
            ActionSpec::Assign(_) => "assign",
            ActionSpec::Increment(_) => "increment",
        }
    }
}

fn increment(context: &mut Context, path: &str) -> Result<(), ActionError> {
    let current = match lookup_path(context, path) {
        Value::Null => 0,
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("field '{}' is not an integer", path))?,
        other => return Err(format!("field '{}' is not numeric: {}", path, other).into()),
    };

    // walk to the parent object, creating intermediate objects as needed
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);
    let mut target = context;
    for segment in segments {
        let entry = target
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        target = match entry {
            Value::Object(map) => map,
            _ => return Err(format!("field '{}' is not an object", segment).into()),
        };
    }
    target.insert(leaf.to_string(), Value::from(current + 1));
    Ok(())
}

impl fmt::Debug for dyn Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(action: &ActionRef, context: &mut Context) -> Result<(), ActionError> {
        let event = Event::new("GO");
        action
            .execute(ActionScope {
                context,
                event: &event,
                from_state: "a",
                to_state: "b",
            })
            .await
    }

    #[tokio::test]
    async fn test_assign_merges_fields() {
        let action: ActionSpec = serde_json::from_value(json!({"assign": {"paid": true}})).unwrap();
        let action = action.into_action();
        let mut context = Context::new();
        context.insert("count".to_string(), json!(1));

        run(&action, &mut context).await.unwrap();
        assert_eq!(Value::Object(context), json!({"count": 1, "paid": true}));
    }

    #[tokio::test]
    async fn test_increment() {
        let action = ActionSpec::Increment("stats.retries".to_string()).into_action();
        let mut context = Context::new();

        run(&action, &mut context).await.unwrap();
        run(&action, &mut context).await.unwrap();
        assert_eq!(Value::Object(context), json!({"stats": {"retries": 2}}));
    }

    #[tokio::test]
    async fn test_increment_rejects_non_numeric() {
        let action = ActionSpec::Increment("name".to_string()).into_action();
        let mut context = Context::new();
        context.insert("name".to_string(), json!("bob"));
        assert!(run(&action, &mut context).await.is_err());
    }

    #[tokio::test]
    async fn test_action_fn_sees_transition() {
        let action = action_fn(|scope| {
            let hop = format!("{}->{}", scope.from_state, scope.to_state);
            scope.context.insert("hop".to_string(), Value::String(hop));
            Ok(())
        });
        let mut context = Context::new();
        run(&action, &mut context).await.unwrap();
        assert_eq!(context["hop"], json!("a->b"));
    }
}
