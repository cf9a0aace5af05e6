//! FSM runtime.
//!
//! A [`Machine`] is created for one dispatch, driven to a stable state, and
//! discarded. One call to [`Machine::dispatch`] runs two phases:
//!
//! 1. External: the first candidate for `(state, event.type)` whose guard
//!    passes is taken.
//! 2. Always-drain: eventless candidates of the current state are taken
//!    repeatedly until none matches.
//!
//! Every state change counts towards `max_depth`; exceeding it aborts the
//! dispatch with [`CoreError::RecursionLimit`].

use crate::action::{ActionRef, ActionScope};
use crate::compiler::{CompiledTransition, CompiledWorkflow};
use crate::error::CoreError;
use crate::event::{Context, Event};
use crate::guard::GuardScope;
use crate::snapshot::{dehydrate, hydrate, SnapshotEnvelope, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Default cap on state changes per dispatch.
pub const DEFAULT_MAX_TRANSITION_DEPTH: u32 = 100;

/// One realized state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionStep {
    pub from: String,
    pub to: String,
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Settled state.
    pub state: String,
    pub done: bool,
    /// State changes in causal order.
    pub transitions: Vec<TransitionStep>,
}

/// Ephemeral runtime for a single instance.
pub struct Machine {
    workflow: Arc<CompiledWorkflow>,
    instance_id: String,
    max_depth: u32,
    state: String,
    status: Status,
    context: Context,
    transitions: Vec<TransitionStep>,
    depth: u32,
}

impl Machine {
    /// Creates a runtime, hydrating from `snapshot` or from the definition.
    pub fn new(
        workflow: Arc<CompiledWorkflow>,
        snapshot: Option<&Value>,
        max_depth: u32,
        instance_id: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let instance_id = instance_id.into();
        let hydrated = hydrate(&instance_id, &workflow, snapshot)?;

        Ok(Self {
            workflow,
            instance_id,
            max_depth,
            state: hydrated.state,
            status: hydrated.status,
            context: hydrated.context,
            transitions: Vec::new(),
            depth: 0,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// State changes taken by the current or last dispatch.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Packages the current state as a snapshot envelope.
    pub fn snapshot(&self) -> SnapshotEnvelope {
        dehydrate(&self.state, self.status, &self.context)
    }

    /// Drives `event` and any chained eventless transitions to a stable state.
    ///
    /// On a `done` instance this is a no-op: no guard or action runs.
    pub async fn dispatch(&mut self, event: &Event) -> Result<DispatchOutcome, CoreError> {
        if self.status == Status::Done {
            return Ok(DispatchOutcome {
                state: self.state.clone(),
                done: true,
                transitions: Vec::new(),
            });
        }

        self.transitions.clear();
        self.depth = 0;

        let workflow = Arc::clone(&self.workflow);

        let candidates = workflow.transitions_for(&self.state, &event.event_type);
        if let Some(transition) = self.select(candidates, event)? {
            match &transition.target {
                Some(target) => self.take(&workflow, transition, target, event).await?,
                None => {
                    let here = self.state.clone();
                    self.run_actions(&transition.name, &transition.actions, event, &here, &here)
                        .await?;
                }
            }
        } else {
            tracing::debug!(
                instance_id = %self.instance_id,
                state = %self.state,
                event = %event.event_type,
                "no transition matched"
            );
        }

        while let Some(transition) = self.select(workflow.always_for(&self.state), event)? {
            match &transition.target {
                Some(target) => self.take(&workflow, transition, target, event).await?,
                None => {
                    // state cannot change, so draining further would spin
                    let here = self.state.clone();
                    self.run_actions(&transition.name, &transition.actions, event, &here, &here)
                        .await?;
                    break;
                }
            }
        }

        self.status = if workflow.is_final(&self.state) {
            Status::Done
        } else {
            Status::Active
        };

        Ok(DispatchOutcome {
            state: self.state.clone(),
            done: self.status == Status::Done,
            transitions: self.transitions.clone(),
        })
    }

    /// First candidate whose guard passes, in declaration order.
    fn select<'w>(
        &self,
        candidates: &'w [CompiledTransition],
        event: &Event,
    ) -> Result<Option<&'w CompiledTransition>, CoreError> {
        let scope = GuardScope {
            context: &self.context,
            event,
        };

        for candidate in candidates {
            let passes = match &candidate.guard {
                None => true,
                Some(guard) => {
                    guard
                        .check(&scope)
                        .map_err(|violation| CoreError::GuardContract {
                            transition: candidate.name.clone(),
                            value: format!("{} = {}", violation.field, violation.value),
                        })?
                }
            };
            if passes {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    async fn take(
        &mut self,
        workflow: &CompiledWorkflow,
        transition: &CompiledTransition,
        target: &str,
        event: &Event,
    ) -> Result<(), CoreError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(CoreError::RecursionLimit {
                instance_id: self.instance_id.clone(),
                depth: self.depth,
                max: self.max_depth,
            });
        }

        let from = self.state.clone();

        if let Some(source) = workflow.state(&from) {
            self.run_actions(&transition.name, &source.exit, event, &from, target)
                .await?;
        }

        self.state = target.to_string();
        self.run_actions(&transition.name, &transition.actions, event, &from, target)
            .await?;

        if from != target {
            if let Some(dest) = workflow.state(target) {
                self.run_actions(&transition.name, &dest.entry, event, &from, target)
                    .await?;
            }
        }

        tracing::debug!(
            instance_id = %self.instance_id,
            transition = %transition.name,
            from = %from,
            to = %target,
            depth = self.depth,
            "transition taken"
        );

        self.transitions.push(TransitionStep {
            from,
            to: target.to_string(),
        });
        Ok(())
    }

    async fn run_actions(
        &mut self,
        label: &str,
        actions: &[ActionRef],
        event: &Event,
        from: &str,
        to: &str,
    ) -> Result<(), CoreError> {
        for action in actions {
            action
                .execute(ActionScope {
                    context: &mut self.context,
                    event,
                    from_state: from,
                    to_state: to,
                })
                .await
                .map_err(|source| CoreError::Action {
                    transition: label.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{action_fn, Action, ActionSpec};
    use crate::compiler::compile;
    use crate::definition::{StateDefinition, TransitionRule, WorkflowDefinition};
    use crate::error::ActionError;
    use crate::guard::Guard;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn machine(def: WorkflowDefinition, max_depth: u32) -> Machine {
        def.validate().unwrap();
        Machine::new(Arc::new(compile(&def)), None, max_depth, "i-1").unwrap()
    }

    fn steps(pairs: &[(&str, &str)]) -> Vec<TransitionStep> {
        pairs
            .iter()
            .map(|(f, t)| TransitionStep {
                from: f.to_string(),
                to: t.to_string(),
            })
            .collect()
    }

    /// Records the order actions ran in.
    fn tracer(tag: &'static str) -> ActionRef {
        action_fn(move |scope| {
            let log = scope
                .context
                .entry("log".to_string())
                .or_insert_with(|| json!([]));
            if let Value::Array(items) = log {
                items.push(json!(tag));
            }
            Ok(())
        })
    }

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("chain", "idle")
            .state("idle", StateDefinition::new().on("START", "A"))
            .state("A", StateDefinition::new().always("B"))
            .state("B", StateDefinition::new().always("C"))
            .state("C", StateDefinition::new())
    }

    #[tokio::test]
    async fn test_always_chain_settles() {
        let mut m = machine(chain(), 10);
        let outcome = m.dispatch(&Event::new("START")).await.unwrap();

        assert_eq!(outcome.state, "C");
        assert!(!outcome.done);
        assert_eq!(
            outcome.transitions,
            steps(&[("idle", "A"), ("A", "B"), ("B", "C")])
        );
        assert_eq!(m.depth(), 3);
    }

    #[tokio::test]
    async fn test_always_loop_hits_depth_limit() {
        let def = WorkflowDefinition::new("loop", "idle")
            .state("idle", StateDefinition::new().on("START", "A"))
            .state("A", StateDefinition::new().always("B"))
            .state("B", StateDefinition::new().always("A"));
        let mut m = machine(def, 5);

        match m.dispatch(&Event::new("START")).await {
            Err(CoreError::RecursionLimit {
                instance_id,
                depth,
                max,
            }) => {
                assert_eq!(instance_id, "i-1");
                assert_eq!(depth, 6);
                assert_eq!(max, 5);
            }
            other => panic!("expected RecursionLimit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_done_instance_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let def = WorkflowDefinition::new("wf", "open")
            .state("open", StateDefinition::new().on("CLOSE", "closed"))
            .state(
                "closed",
                StateDefinition::final_state().on(
                    "CLOSE",
                    TransitionRule::to("open")
                        .guard(Guard::predicate(move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            true
                        })),
                ),
            );
        let mut m = machine(def, 10);

        let first = m.dispatch(&Event::new("CLOSE")).await.unwrap();
        assert!(first.done);
        assert_eq!(m.status(), Status::Done);

        let second = m.dispatch(&Event::new("CLOSE")).await.unwrap();
        assert_eq!(second.state, "closed");
        assert!(second.done);
        assert!(second.transitions.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_matching_guard_wins() {
        let def = WorkflowDefinition::new("wf", "start")
            .state(
                "start",
                StateDefinition::new()
                    .on(
                        "GO",
                        TransitionRule::to("vip").guard(Guard::expr("ctx.vip").unwrap()),
                    )
                    .on("GO", "regular")
                    .on("GO", "never"),
            )
            .state("vip", StateDefinition::new())
            .state("regular", StateDefinition::new())
            .state("never", StateDefinition::new());

        let mut m = machine(def.clone(), 10);
        assert_eq!(m.dispatch(&Event::new("GO")).await.unwrap().state, "regular");

        let mut context = Context::new();
        context.insert("vip".to_string(), json!(true));
        let mut m = machine(def.context(context), 10);
        assert_eq!(m.dispatch(&Event::new("GO")).await.unwrap().state, "vip");
    }

    #[tokio::test]
    async fn test_unmatched_event_leaves_state() {
        let mut m = machine(chain(), 10);
        let outcome = m.dispatch(&Event::new("UNKNOWN")).await.unwrap();
        assert_eq!(outcome.state, "idle");
        assert!(outcome.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_targetless_rule_runs_actions_then_drains() {
        let def = WorkflowDefinition::new("wf", "waiting")
            .state(
                "waiting",
                StateDefinition::new()
                    .on(
                        "PING",
                        TransitionRule::internal()
                            .action(ActionSpec::Increment("pings".to_string()).into_action()),
                    )
                    .always(
                        TransitionRule::to("ready").guard(Guard::expr("ctx.pings >= 2").unwrap()),
                    ),
            )
            .state("ready", StateDefinition::new());
        let mut m = machine(def, 10);

        let first = m.dispatch(&Event::new("PING")).await.unwrap();
        assert_eq!(first.state, "waiting");
        assert!(first.transitions.is_empty());
        assert_eq!(m.context()["pings"], json!(1));
        assert_eq!(m.depth(), 0);

        let second = m.dispatch(&Event::new("PING")).await.unwrap();
        assert_eq!(second.state, "ready");
        assert_eq!(second.transitions, steps(&[("waiting", "ready")]));
    }

    #[tokio::test]
    async fn test_action_order_exit_transition_entry() {
        let def = WorkflowDefinition::new("wf", "a")
            .state(
                "a",
                StateDefinition::new()
                    .exit(tracer("exit-a"))
                    .on("GO", TransitionRule::to("b").action(tracer("go")))
                    .on("STAY", TransitionRule::to("a").action(tracer("stay"))),
            )
            .state("b", StateDefinition::new().entry(tracer("entry-b")));

        let mut m = machine(def.clone(), 10);
        m.dispatch(&Event::new("GO")).await.unwrap();
        assert_eq!(m.context()["log"], json!(["exit-a", "go", "entry-b"]));

        // self-transition: exit and transition actions run, entry does not
        let def = def.state("a", {
            StateDefinition::new()
                .exit(tracer("exit-a"))
                .entry(tracer("entry-a"))
                .on("STAY", TransitionRule::to("a").action(tracer("stay")))
        });
        let mut m = machine(def, 10);
        let outcome = m.dispatch(&Event::new("STAY")).await.unwrap();
        assert_eq!(m.context()["log"], json!(["exit-a", "stay"]));
        assert_eq!(outcome.transitions, steps(&[("a", "a")]));
    }

    #[tokio::test]
    async fn test_guard_contract_violation_aborts() {
        let def = WorkflowDefinition::new("wf", "a")
            .context(serde_json::from_value(json!({"approved": "yes"})).unwrap())
            .state(
                "a",
                StateDefinition::new()
                    .on("GO", TransitionRule::to("b").guard(Guard::expr("ctx.approved").unwrap())),
            )
            .state("b", StateDefinition::new());
        let mut m = machine(def, 10);

        match m.dispatch(&Event::new("GO")).await {
            Err(CoreError::GuardContract { transition, value }) => {
                assert_eq!(transition, "a:on:GO:0");
                assert!(value.contains("ctx.approved"));
            }
            other => panic!("expected GuardContract, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_action_failure_surfaces() {
        let def = WorkflowDefinition::new("wf", "a")
            .state(
                "a",
                StateDefinition::new().on(
                    "GO",
                    TransitionRule::to("b").action(action_fn(|_| Err("card declined".into()))),
                ),
            )
            .state("b", StateDefinition::new());
        let mut m = machine(def, 10);

        let err = m.dispatch(&Event::new("GO")).await.unwrap_err();
        assert!(matches!(err, CoreError::Action { .. }));
        assert!(err.to_string().contains("card declined"));
    }

    struct SlowIncrement;

    #[async_trait]
    impl Action for SlowIncrement {
        async fn execute(&self, scope: ActionScope<'_>) -> Result<(), ActionError> {
            tokio::task::yield_now().await;
            let next = scope.context.get("n").and_then(Value::as_i64).unwrap_or(0) + 1;
            scope.context.insert("n".to_string(), json!(next));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_async_actions_share_context() {
        let slow: ActionRef = Arc::new(SlowIncrement);
        let def = WorkflowDefinition::new("wf", "a")
            .state(
                "a",
                StateDefinition::new().on(
                    "GO",
                    TransitionRule::to("b").action(slow.clone()).action(slow),
                ),
            )
            .state(
                "b",
                StateDefinition::new()
                    .always(TransitionRule::to("c").guard(Guard::expr("ctx.n == 2").unwrap())),
            )
            .state("c", StateDefinition::final_state());
        let mut m = machine(def, 10);

        let outcome = m.dispatch(&Event::new("GO")).await.unwrap();
        assert_eq!(outcome.state, "c");
        assert!(outcome.done);
        assert_eq!(m.context()["n"], json!(2));
    }

    #[tokio::test]
    async fn test_snapshot_reflects_settled_state() {
        let mut m = machine(chain(), 10);
        m.dispatch(&Event::new("START")).await.unwrap();
        let env = m.snapshot();
        assert_eq!(env.state, "C");
        assert_eq!(env.status, Status::Active);

        let restored =
            Machine::new(Arc::new(compile(&chain())), Some(&env.to_value()), 10, "i-1").unwrap();
        assert_eq!(restored.state(), "C");
    }

    #[tokio::test]
    async fn test_targetless_always_runs_once_and_stops_drain() {
        let def = WorkflowDefinition::new("wf", "idle")
            .state("idle", StateDefinition::new().on("START", "a"))
            .state(
                "a",
                StateDefinition::new()
                    .always(
                        TransitionRule::internal()
                            .action(ActionSpec::Increment("ticks".to_string()).into_action()),
                    )
                    .always("b"),
            )
            .state("b", StateDefinition::new());
        // a spinning drain would trip this limit
        let mut m = machine(def, 2);

        let outcome = m.dispatch(&Event::new("START")).await.unwrap();
        assert_eq!(outcome.state, "a");
        assert_eq!(
            outcome.transitions,
            vec![TransitionStep {
                from: "idle".to_string(),
                to: "a".to_string(),
            }]
        );
        assert_eq!(m.context()["ticks"], json!(1));
        assert_eq!(m.depth(), 1);

        // every later dispatch drains once more, still without moving
        let outcome = m.dispatch(&Event::new("NOTHING")).await.unwrap();
        assert_eq!(outcome.state, "a");
        assert!(outcome.transitions.is_empty());
        assert_eq!(m.context()["ticks"], json!(2));
    }
}
