//! State machine definition types and construction-time validation.
//!
//! A machine is a set of named states with guarded transitions keyed by
//! event type. The `transition` field of a state is a sum type: either an
//! unconditional "always go to X", or a table from event type (empty
//! string meaning "always") to an ordered list of guarded candidates,
//! resolved first-match-wins.

use futures_util::future::BoxFuture;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::context::StepHandle;
use crate::runnable::{CancelProbe, NodeError};

/// An event sent into a machine with [`send`](super::StateMachineRunner::send).
#[derive(Clone, Debug)]
pub struct MachineEvent {
    /// Event type string matched against transition tables.
    pub event_type: String,
    /// Arbitrary payload forwarded to guards and bodies.
    pub data: Value,
    /// Keep the event queued while the current state has no handler for
    /// it, instead of dropping it.
    pub queue_if_unhandled: bool,
}

impl MachineEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            queue_if_unhandled: false,
        }
    }

    /// An event retained in the queue until some state can handle it.
    pub fn queued(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            queue_if_unhandled: true,
        }
    }
}

/// Everything a state body receives when its state is entered.
pub struct StateInput<C> {
    /// The machine's shared context value.
    pub context: Arc<C>,
    /// Value carried into this state (the previous state's output).
    pub input: Value,
    /// The external input supplied to the machine as a whole.
    pub root_input: Value,
    /// Name of the state transitioned from, if any.
    pub previous_state: Option<String>,
    /// The event that drove the transition into this state, if any.
    pub event: Option<MachineEvent>,
    /// Tracing handle for this state's step.
    pub span: StepHandle,
    /// Cooperative cancellation probe.
    pub cancel: CancelProbe,
}

/// Type-erased state body.
pub type StateBody<C> =
    Arc<dyn Fn(StateInput<C>) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>;

/// What a transition guard sees when evaluated.
pub struct GuardArgs<'a, C> {
    /// The machine's shared context value.
    pub context: &'a Arc<C>,
    /// The current state's output (the value a fired transition would
    /// carry into the target state).
    pub output: &'a Value,
    /// The event under consideration, absent for always-transitions.
    pub event: Option<&'a MachineEvent>,
}

/// Guard predicate: `true` fires the candidate, `false` skips to the next.
pub type Guard<C> = Arc<dyn Fn(&GuardArgs<'_, C>) -> bool + Send + Sync>;

/// One transition candidate: a target state and an optional guard.
pub struct TransitionCandidate<C> {
    pub(crate) target: String,
    pub(crate) condition: Option<Guard<C>>,
}

impl<C> TransitionCandidate<C> {
    /// Unguarded candidate; always fires when reached.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: None,
        }
    }

    /// Guarded candidate; fires only when `guard` returns true.
    pub fn when<F>(target: impl Into<String>, guard: F) -> Self
    where
        F: Fn(&GuardArgs<'_, C>) -> bool + Send + Sync + 'static,
    {
        Self {
            target: target.into(),
            condition: Some(Arc::new(guard)),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// A state's transition declaration.
pub enum TransitionSpec<C> {
    /// Unconditional next state; fires only for always-resolution and
    /// ignores events entirely.
    Always(String),
    /// Dispatch table keyed by event type. The empty string key holds the
    /// always-candidates tried after each state body returns.
    On(FxHashMap<String, Vec<TransitionCandidate<C>>>),
}

impl<C> TransitionSpec<C> {
    /// Shorthand for the bare next-state form.
    pub fn always(target: impl Into<String>) -> Self {
        Self::Always(target.into())
    }

    /// Start an event-keyed transition table.
    #[must_use]
    pub fn table() -> TransitionTable<C> {
        TransitionTable {
            entries: FxHashMap::default(),
        }
    }

    pub(crate) fn targets(&self) -> Vec<&str> {
        match self {
            Self::Always(target) => vec![target.as_str()],
            Self::On(map) => map
                .values()
                .flatten()
                .map(TransitionCandidate::target)
                .collect(),
        }
    }

    pub(crate) fn has_always(&self) -> bool {
        match self {
            Self::Always(_) => true,
            Self::On(map) => map.contains_key(""),
        }
    }

    pub(crate) fn has_handler(&self, event_type: &str) -> bool {
        match self {
            Self::Always(_) => false,
            Self::On(map) => map.contains_key(event_type),
        }
    }
}

/// Builder for [`TransitionSpec::On`].
pub struct TransitionTable<C> {
    entries: FxHashMap<String, Vec<TransitionCandidate<C>>>,
}

impl<C> TransitionTable<C> {
    /// Candidates tried for events of `event_type`.
    #[must_use]
    pub fn on(
        mut self,
        event_type: impl Into<String>,
        candidates: Vec<TransitionCandidate<C>>,
    ) -> Self {
        self.entries.insert(event_type.into(), candidates);
        self
    }

    /// Candidates tried unconditionally after the state body returns.
    #[must_use]
    pub fn always(self, candidates: Vec<TransitionCandidate<C>>) -> Self {
        self.on("", candidates)
    }

    #[must_use]
    pub fn build(self) -> TransitionSpec<C> {
        TransitionSpec::On(self.entries)
    }
}

/// Descriptor for one machine state.
///
/// States may be pure routing (no body): the machine enters them, runs
/// nothing, and immediately attempts their always-transition.
pub struct StateConfig<C> {
    pub(crate) run: Option<StateBody<C>>,
    pub(crate) is_final: bool,
    pub(crate) error_state: Option<String>,
    pub(crate) semaphore_key: Option<String>,
    pub(crate) transition: Option<TransitionSpec<C>>,
}

impl<C> Default for StateConfig<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> StateConfig<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            run: None,
            is_final: false,
            error_state: None,
            semaphore_key: None,
            transition: None,
        }
    }

    /// Attach the state's body.
    #[must_use]
    pub fn with_run<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(StateInput<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |input| Box::pin(body(input))));
        self
    }

    /// Mark terminal: the machine halts scheduling once it enters this
    /// state.
    #[must_use]
    pub fn final_state(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Per-state error-state override.
    #[must_use]
    pub fn with_error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = Some(state.into());
        self
    }

    /// Rate-limit this state's body under the given semaphore key.
    #[must_use]
    pub fn with_semaphore_key(mut self, key: impl Into<String>) -> Self {
        self.semaphore_key = Some(key.into());
        self
    }

    /// Declare the state's transitions.
    #[must_use]
    pub fn with_transition(mut self, transition: TransitionSpec<C>) -> Self {
        self.transition = Some(transition);
        self
    }

    /// Shorthand for an unconditional transition to `target`.
    #[must_use]
    pub fn goto(self, target: impl Into<String>) -> Self {
        self.with_transition(TransitionSpec::always(target))
    }
}

/// Construction-time machine validation errors.
#[derive(Debug, Error, Diagnostic)]
pub enum MachineError {
    #[error("machine {machine}: initial state {initial} does not exist")]
    #[diagnostic(code(trellis::machine::unknown_initial))]
    UnknownInitial { machine: String, initial: String },

    #[error("machine {machine}: error state {error_state} does not exist")]
    #[diagnostic(code(trellis::machine::unknown_error_state))]
    UnknownErrorState {
        machine: String,
        error_state: String,
    },

    #[error("machine {machine}: state {state} declares unknown error state {error_state}")]
    #[diagnostic(code(trellis::machine::unknown_state_error_state))]
    UnknownStateErrorState {
        machine: String,
        state: String,
        error_state: String,
    },

    #[error("machine {machine}: state {state} declares transition to unknown state {target}")]
    #[diagnostic(
        code(trellis::machine::unknown_target),
        help("Every transition target must name a declared state.")
    )]
    UnknownTarget {
        machine: String,
        state: String,
        target: String,
    },
}

/// Immutable definition of a whole state machine.
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use trellis::machine::{MachineConfig, StateConfig, TransitionSpec};
///
/// let machine = MachineConfig::new("pinger", "ping", || ())
///     .add_state(
///         "ping",
///         StateConfig::new()
///             .with_run(|_input| async move { Ok(json!("ping")) })
///             .goto("pong"),
///     )
///     .add_state("pong", StateConfig::new().final_state());
/// ```
pub struct MachineConfig<C> {
    pub(crate) name: String,
    pub(crate) initial: String,
    pub(crate) error_state: Option<String>,
    pub(crate) context_factory: Arc<dyn Fn() -> C + Send + Sync>,
    pub(crate) nodes: FxHashMap<String, Arc<StateConfig<C>>>,
}

impl<C> MachineConfig<C> {
    /// Create a definition with a context factory invoked once per run.
    pub fn new<F>(name: impl Into<String>, initial: impl Into<String>, context_factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            initial: initial.into(),
            error_state: None,
            context_factory: Arc::new(context_factory),
            nodes: FxHashMap::default(),
        }
    }

    /// Register a state under `name`.
    #[must_use]
    pub fn add_state(mut self, name: impl Into<String>, state: StateConfig<C>) -> Self {
        self.nodes.insert(name.into(), Arc::new(state));
        self
    }

    /// Global error state entered when a body fails and the failing state
    /// declares no override.
    #[must_use]
    pub fn with_error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = Some(state.into());
        self
    }

    /// The machine's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail fast on unknown initial, error, or transition-target states.
    pub fn validate(&self) -> Result<(), MachineError> {
        if !self.nodes.contains_key(&self.initial) {
            return Err(MachineError::UnknownInitial {
                machine: self.name.clone(),
                initial: self.initial.clone(),
            });
        }
        if let Some(error_state) = &self.error_state {
            if !self.nodes.contains_key(error_state) {
                return Err(MachineError::UnknownErrorState {
                    machine: self.name.clone(),
                    error_state: error_state.clone(),
                });
            }
        }
        for (name, state) in &self.nodes {
            if let Some(error_state) = &state.error_state {
                if !self.nodes.contains_key(error_state) {
                    return Err(MachineError::UnknownStateErrorState {
                        machine: self.name.clone(),
                        state: name.clone(),
                        error_state: error_state.clone(),
                    });
                }
            }
            if let Some(transition) = &state.transition {
                for target in transition.targets() {
                    if !self.nodes.contains_key(target) {
                        return Err(MachineError::UnknownTarget {
                            machine: self.name.clone(),
                            state: name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
