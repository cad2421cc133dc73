//! Single-actor state machine execution.
//!
//! The runner drives one machine over its definition: evaluate the
//! current state's body, drain queued events against its transitions,
//! fall back to the always-transition, and either advance or park in
//! `WaitingForEvent`. Exactly one state is active at a time; events
//! arriving while a body runs are queued and considered when it returns.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::definition::{
    GuardArgs, MachineConfig, MachineError, MachineEvent, StateInput, TransitionSpec,
};
use crate::context::{current_scope, scoped, start_run, RunOptions, RunScope};
use crate::events::{EventBus, EventData, EventSender, EventType, TransitionData};
use crate::runnable::{CancelProbe, CompletionCell, Outcome, RunError, Runnable, RunnerNotice};
use crate::semaphores::{acquire_many, SemaphoreMap};
use crate::types::StepId;

/// Live status of a machine runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    /// Constructed, nothing stepped yet.
    Initial,
    /// A transition landed on a non-final state; the next step may run.
    Ready,
    /// Blocked acquiring the configured semaphore key.
    PendingSemaphore,
    /// A state body is executing.
    Running,
    /// No transition fired; an external event is required to advance.
    WaitingForEvent,
    Final,
    Error,
    Cancelled,
}

impl MachineStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Ready => "ready",
            Self::PendingSemaphore => "pendingSemaphore",
            Self::Running => "running",
            Self::WaitingForEvent => "waitingForEvent",
            Self::Final => "final",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Cancelled)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the machine currently stands.
#[derive(Clone, Debug)]
pub struct CurrentState {
    pub state: String,
    pub previous_state: Option<String>,
    /// Value carried into the state (the previous state's output).
    pub input: Value,
    /// The event that drove the transition into the state, if any.
    pub event: Option<MachineEvent>,
    /// The state body's output, once it has run.
    pub output: Option<Value>,
}

/// What happened to an event handed to [`StateMachineRunner::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// A transition fired immediately.
    Fired,
    /// Appended to the event queue.
    Queued,
    /// No handler fired and the event was not queueable.
    Dropped,
    /// The machine is final or cancelled; events are no longer acted upon.
    Ignored,
}

struct MachineInner {
    status: MachineStatus,
    current: CurrentState,
    queue: VecDeque<MachineEvent>,
    machine_step: Option<StepId>,
    step_index: u64,
    scope: Option<RunScope>,
}

/// Executes one machine definition against one root input.
///
/// # Examples
///
/// ```rust,no_run
/// use serde_json::json;
/// use trellis::machine::{MachineConfig, StateConfig, StateMachineRunner};
/// use trellis::events::EventBus;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let machine = MachineConfig::new("echo", "only", || ())
///     .add_state(
///         "only",
///         StateConfig::new()
///             .with_run(|input| async move { Ok(input.root_input.clone()) })
///             .goto("done"),
///     )
///     .add_state("done", StateConfig::new().final_state());
///
/// let bus = EventBus::default();
/// bus.listen_for_events();
/// let runner = StateMachineRunner::new(machine, json!("hi"))?.with_events(&bus);
/// assert_eq!(runner.run().await?, json!("hi"));
/// # Ok(())
/// # }
/// ```
pub struct StateMachineRunner<C> {
    config: MachineConfig<C>,
    context: Arc<C>,
    root_input: Value,
    semaphores: Vec<SemaphoreMap>,
    sender: EventSender,
    cancel: CancellationToken,
    completion: CompletionCell,
    notices: broadcast::Sender<RunnerNotice>,
    inner: Mutex<MachineInner>,
    /// Serializes `step` calls; the machine is a single actor.
    step_lock: tokio::sync::Mutex<()>,
    /// Wakes `run` when `send` or `cancel` changes what can happen next.
    kick: Notify,
}

impl<C: Send + Sync + 'static> StateMachineRunner<C> {
    /// Validate the definition and prepare a runner.
    pub fn new(config: MachineConfig<C>, root_input: Value) -> Result<Self, MachineError> {
        config.validate()?;
        let context = Arc::new((config.context_factory)());
        let (notices, _) = broadcast::channel(16);
        let current = CurrentState {
            state: config.initial.clone(),
            previous_state: None,
            input: root_input.clone(),
            event: None,
            output: None,
        };
        Ok(Self {
            config,
            context,
            root_input,
            semaphores: Vec::new(),
            sender: EventSender::disconnected(),
            cancel: CancellationToken::new(),
            completion: CompletionCell::new(),
            notices,
            inner: Mutex::new(MachineInner {
                status: MachineStatus::Initial,
                current,
                queue: VecDeque::new(),
                machine_step: None,
                step_index: 0,
                scope: None,
            }),
            step_lock: tokio::sync::Mutex::new(()),
            kick: Notify::new(),
        })
    }

    /// Emit events to the given bus.
    #[must_use]
    pub fn with_events(mut self, bus: &EventBus) -> Self {
        self.sender = bus.get_sender();
        self
    }

    /// Emit events through an existing sender.
    #[must_use]
    pub fn with_sender(mut self, sender: EventSender) -> Self {
        self.sender = sender;
        self
    }

    /// Rate-limit states that declare a `semaphore_key` against these maps.
    #[must_use]
    pub fn with_semaphores(mut self, semaphores: Vec<SemaphoreMap>) -> Self {
        self.semaphores = semaphores;
        self
    }

    /// Replace the context built by the definition's factory.
    #[must_use]
    pub fn with_context(mut self, context: Arc<C>) -> Self {
        self.context = context;
        self
    }

    /// The shared context value state bodies observe.
    #[must_use]
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    #[must_use]
    pub fn status(&self) -> MachineStatus {
        self.inner.lock().status
    }

    #[must_use]
    pub fn current_state(&self) -> CurrentState {
        self.inner.lock().current.clone()
    }

    /// Step id of the machine as a whole, once started.
    #[must_use]
    pub fn machine_step(&self) -> Option<StepId> {
        self.inner.lock().machine_step.clone()
    }

    /// Monotone step counter, for diagnostics.
    #[must_use]
    pub fn step_index(&self) -> u64 {
        self.inner.lock().step_index
    }

    /// Event types the current state declares transitions for, sorted;
    /// the always key is excluded.
    #[must_use]
    pub fn available_events(&self) -> Vec<String> {
        let inner = self.inner.lock();
        match self
            .config
            .nodes
            .get(&inner.current.state)
            .and_then(|state| state.transition.as_ref())
        {
            Some(TransitionSpec::On(map)) => {
                let mut events: Vec<String> =
                    map.keys().filter(|key| !key.is_empty()).cloned().collect();
                events.sort_unstable();
                events
            }
            _ => Vec::new(),
        }
    }

    /// Whether another step could make progress right now.
    #[must_use]
    pub fn can_step(&self) -> bool {
        let inner = self.inner.lock();
        self.can_step_locked(&inner)
    }

    fn can_step_locked(&self, inner: &MachineInner) -> bool {
        if matches!(
            inner.status,
            MachineStatus::Running
                | MachineStatus::Cancelled
                | MachineStatus::WaitingForEvent
                | MachineStatus::Final
        ) {
            return false;
        }
        let Some(state) = self.config.nodes.get(&inner.current.state) else {
            return false;
        };
        state.run.is_some()
            || state
                .transition
                .as_ref()
                .is_some_and(TransitionSpec::has_always)
    }

    /// Inject an event.
    ///
    /// While a body runs (or when the event asks to queue and the current
    /// state has no handler for it) the event is appended to the queue;
    /// otherwise a transition is attempted immediately.
    pub fn send(&self, event: MachineEvent) -> SendOutcome {
        let mut inner = self.inner.lock();
        if matches!(
            inner.status,
            MachineStatus::Final | MachineStatus::Cancelled
        ) {
            return SendOutcome::Ignored;
        }
        let has_handler = self
            .config
            .nodes
            .get(&inner.current.state)
            .and_then(|state| state.transition.as_ref())
            .is_some_and(|spec| spec.has_handler(&event.event_type));
        if inner.status == MachineStatus::Running
            || (event.queue_if_unhandled && !has_handler)
            || inner.scope.is_none()
        {
            inner.queue.push_back(event);
            return SendOutcome::Queued;
        }
        match self.resolve_target(&inner, Some(&event)) {
            Some(target) => {
                self.apply_transition(&mut inner, target, Some(event));
                drop(inner);
                self.kick.notify_one();
                SendOutcome::Fired
            }
            None => SendOutcome::Dropped,
        }
    }

    /// Request cooperative cancellation. The machine never transitions
    /// again; a running body observes the probe on its next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock();
        if !matches!(inner.status, MachineStatus::Final | MachineStatus::Error) {
            Self::set_status_locked(&mut inner, MachineStatus::Cancelled);
        }
        drop(inner);
        self.completion.resolve(Outcome::Cancelled);
        let _ = self.notices.send(RunnerNotice::Cancelled);
        self.kick.notify_one();
    }

    /// Step to quiescence: run states and transitions until the machine
    /// is final, waiting for an event, in error, or cancelled.
    pub async fn run_until_settled(&self) -> Result<MachineStatus, RunError> {
        let options = RunOptions::new(self.config.name.clone(), self.sender.clone());
        start_run(options, async {
            while self.can_step() {
                self.step().await?;
            }
            Ok(self.status())
        })
        .await
    }

    /// Drive to a terminal outcome, sleeping through `WaitingForEvent`
    /// until [`send`](Self::send) or [`cancel`](Self::cancel) changes
    /// what can happen.
    #[instrument(skip(self), fields(machine = %self.config.name))]
    pub async fn run(&self) -> Result<Value, RunError> {
        let options = RunOptions::new(self.config.name.clone(), self.sender.clone());
        start_run(options, async {
            loop {
                while self.can_step() {
                    self.step().await?;
                }
                match self.status() {
                    MachineStatus::Final => {
                        return self.completion.wait().await.into_machine_result()
                    }
                    MachineStatus::Cancelled => return Err(RunError::Cancelled),
                    MachineStatus::Error => {
                        return self.completion.wait().await.into_machine_result()
                    }
                    _ => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
                            _ = self.kick.notified() => {}
                        }
                    }
                }
            }
        })
        .await
    }

    /// Completion future; see [`Runnable::finished`].
    pub async fn finished(&self) -> Result<Value, RunError> {
        self.completion.wait().await.into_machine_result()
    }

    /// Attempt one transition step. Returns whether anything ran.
    pub async fn step(&self) -> Result<bool, RunError> {
        let _serial = self.step_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(false);
        }

        // Snapshot the work under the lock; the body runs without it.
        let (machine_scope, state_name, state, input, event, previous) = {
            let mut inner = self.inner.lock();
            if !self.can_step_locked(&inner) {
                return Ok(false);
            }
            if inner.scope.is_none() {
                let base = match current_scope() {
                    Some(scope) => scope.child_for(self.config.name.clone()),
                    None => RunScope::root(self.config.name.clone(), self.sender.clone())
                        .child_for(self.config.name.clone()),
                };
                inner.machine_step = base.current_step().cloned();
                inner.scope = Some(base);
            }
            let scope = inner.scope.clone().expect("scope just established");
            if inner.status == MachineStatus::Initial {
                scope.emit_start(
                    EventType::MachineStart,
                    "",
                    self.root_input.clone(),
                    None,
                    None,
                );
            }
            inner.step_index += 1;
            let state_name = inner.current.state.clone();
            let state = Arc::clone(&self.config.nodes[&state_name]);
            (
                scope,
                state_name,
                state,
                inner.current.input.clone(),
                inner.current.event.clone(),
                inner.current.previous_state.clone(),
            )
        };

        // Hold permits for the whole body; released on every exit path.
        let _permits = match &state.semaphore_key {
            Some(key) if !self.semaphores.is_empty() => {
                self.set_status(MachineStatus::PendingSemaphore);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(false),
                    permits = acquire_many(&self.semaphores, key) => Some(permits),
                }
            }
            _ => None,
        };

        self.set_status(MachineStatus::Running);

        let node_scope = machine_scope.child_step();
        let span = node_scope
            .current_handle()
            .expect("child step allocates a handle")
            .clone();
        let start_info = event
            .as_ref()
            .map(|event| json!({ "event": event.event_type }));
        node_scope.emit_start(
            EventType::MachineNodeStart,
            &state_name,
            input.clone(),
            None,
            start_info,
        );

        let mut body_error = None;
        if let Some(body) = &state.run {
            let state_input = StateInput {
                context: Arc::clone(&self.context),
                input: input.clone(),
                root_input: self.root_input.clone(),
                previous_state: previous,
                event: event.clone(),
                span,
                cancel: CancelProbe::new(self.cancel.clone()),
            };
            let result = scoped(node_scope.clone(), body(state_input)).await;
            // A body that ignored cancellation still ran to completion;
            // its output is discarded and nothing further is emitted.
            if self.cancel.is_cancelled()
                || matches!(&result, Err(error) if error.is_cancelled())
            {
                self.mark_cancelled();
                return Ok(false);
            }
            match result {
                Ok(output) => {
                    node_scope.emit_end(EventType::MachineNodeFinish, &state_name, output.clone());
                    self.inner.lock().current.output = Some(output);
                }
                Err(error) => body_error = Some(error),
            }
        }
        if self.cancel.is_cancelled() {
            self.mark_cancelled();
            return Ok(false);
        }

        if let Some(error) = body_error {
            return self.absorb_or_fail(&state_name, &state.error_state, &node_scope, error);
        }

        let mut inner = self.inner.lock();
        if inner.status == MachineStatus::Cancelled {
            return Ok(false);
        }
        let mut transitioned = self.drain_queue(&mut inner);
        if !transitioned {
            if let Some(target) = self.resolve_target(&inner, None) {
                self.apply_transition(&mut inner, target, None);
                transitioned = true;
            }
        }
        if !transitioned && inner.status == MachineStatus::Running {
            Self::set_status_locked(&mut inner, MachineStatus::WaitingForEvent);
        }
        Ok(true)
    }

    /// Settle a cancellation observed mid-step: the machine never
    /// transitions again and the completion future rejects.
    fn mark_cancelled(&self) {
        let mut inner = self.inner.lock();
        if !matches!(inner.status, MachineStatus::Final | MachineStatus::Error) {
            Self::set_status_locked(&mut inner, MachineStatus::Cancelled);
        }
        drop(inner);
        self.completion.resolve(Outcome::Cancelled);
    }

    /// Body failure: divert into the error state when one is declared,
    /// otherwise halt in `Error` status and re-raise.
    fn absorb_or_fail(
        &self,
        state_name: &str,
        state_error_state: &Option<String>,
        node_scope: &RunScope,
        error: crate::runnable::NodeError,
    ) -> Result<bool, RunError> {
        let message = error.to_string();
        node_scope.emit_error(EventType::MachineNodeError, state_name, &message);

        let fallback = state_error_state
            .clone()
            .or_else(|| self.config.error_state.clone());
        let mut inner = self.inner.lock();
        match fallback {
            Some(target) => {
                let from = inner.current.state.clone();
                let is_final = self.config.nodes[&target].is_final;
                if let Some(scope) = &inner.scope {
                    scope.emit_data(
                        EventType::MachineTransition,
                        &from,
                        EventData::Transition(TransitionData {
                            from: from.clone(),
                            to: target.clone(),
                            input: inner.current.input.clone(),
                            output: Value::Null,
                            event: None,
                            is_final,
                        }),
                    );
                }
                inner.current = CurrentState {
                    state: target,
                    previous_state: Some(from),
                    input: Value::String(message),
                    event: None,
                    output: None,
                };
                if is_final {
                    self.finalize_locked(&mut inner);
                } else {
                    Self::set_status_locked(&mut inner, MachineStatus::Ready);
                }
                Ok(true)
            }
            None => {
                Self::set_status_locked(&mut inner, MachineStatus::Error);
                if let Some(scope) = &inner.scope {
                    scope.emit_error(EventType::MachineError, "", &message);
                }
                drop(inner);
                self.completion.resolve(Outcome::Failed {
                    node: state_name.to_string(),
                    message: message.clone(),
                });
                let _ = self.notices.send(RunnerNotice::Error(message.clone()));
                Err(RunError::StateFailed {
                    state: state_name.to_string(),
                    message,
                })
            }
        }
    }

    /// Scan the queue in order; the first event whose transition fires is
    /// consumed, later entries survive only if they asked to stay queued.
    fn drain_queue(&self, inner: &mut MachineInner) -> bool {
        let mut transitioned = false;
        let drained: Vec<MachineEvent> = inner.queue.drain(..).collect();
        let mut retained = VecDeque::new();
        for event in drained {
            if transitioned {
                if event.queue_if_unhandled {
                    retained.push_back(event);
                }
                continue;
            }
            match self.resolve_target(inner, Some(&event)) {
                Some(target) => {
                    self.apply_transition(inner, target, Some(event));
                    transitioned = true;
                }
                None => {
                    // Handler present but guard denied drops the event;
                    // no handler in the current state keeps it, if asked.
                    let has_handler = self
                        .config
                        .nodes
                        .get(&inner.current.state)
                        .and_then(|state| state.transition.as_ref())
                        .is_some_and(|spec| spec.has_handler(&event.event_type));
                    if event.queue_if_unhandled && !has_handler {
                        retained.push_back(event);
                    }
                }
            }
        }
        inner.queue = retained;
        transitioned
    }

    /// First-match-wins transition resolution for an event (or the
    /// always key when `event` is absent).
    fn resolve_target(&self, inner: &MachineInner, event: Option<&MachineEvent>) -> Option<String> {
        let state = self.config.nodes.get(&inner.current.state)?;
        let spec = state.transition.as_ref()?;
        match spec {
            // The bare-string form is unconditional and ignores events.
            TransitionSpec::Always(target) => event.is_none().then(|| target.clone()),
            TransitionSpec::On(map) => {
                let key = event.map_or("", |event| event.event_type.as_str());
                let candidates = map.get(key)?;
                let output = inner.current.output.clone().unwrap_or(Value::Null);
                let args = GuardArgs {
                    context: &self.context,
                    output: &output,
                    event,
                };
                for candidate in candidates {
                    match &candidate.condition {
                        None => return Some(candidate.target.clone()),
                        Some(guard) if guard(&args) => return Some(candidate.target.clone()),
                        Some(_) => {}
                    }
                }
                None
            }
        }
    }

    fn apply_transition(
        &self,
        inner: &mut MachineInner,
        target: String,
        event: Option<MachineEvent>,
    ) {
        let from = inner.current.state.clone();
        let output = inner.current.output.clone().unwrap_or(Value::Null);
        let is_final = self.config.nodes[&target].is_final;
        if let Some(scope) = &inner.scope {
            scope.emit_data(
                EventType::MachineTransition,
                &from,
                EventData::Transition(TransitionData {
                    from: from.clone(),
                    to: target.clone(),
                    input: inner.current.input.clone(),
                    output: output.clone(),
                    event: event.as_ref().map(|event| event.event_type.clone()),
                    is_final,
                }),
            );
        }
        tracing::debug!(
            target: "trellis::machine",
            machine = %self.config.name,
            %from,
            to = %target,
            "transition"
        );
        inner.current = CurrentState {
            state: target,
            previous_state: Some(from),
            input: output,
            event,
            output: None,
        };
        if is_final {
            self.finalize_locked(inner);
        } else {
            Self::set_status_locked(inner, MachineStatus::Ready);
        }
    }

    fn finalize_locked(&self, inner: &mut MachineInner) {
        Self::set_status_locked(inner, MachineStatus::Final);
        let result = inner.current.input.clone();
        if let Some(scope) = &inner.scope {
            scope.emit_end(EventType::MachineFinish, "", result.clone());
        }
        self.completion.resolve(Outcome::Finished(result.clone()));
        let _ = self.notices.send(RunnerNotice::Finished(result));
        self.kick.notify_one();
    }

    fn set_status(&self, status: MachineStatus) {
        let mut inner = self.inner.lock();
        Self::set_status_locked(&mut inner, status);
    }

    fn set_status_locked(inner: &mut MachineInner, status: MachineStatus) {
        inner.status = status;
        if let Some(scope) = &inner.scope {
            scope.emit_data(
                EventType::MachineStatus,
                &inner.current.state,
                EventData::Status {
                    status: status.as_str().to_string(),
                },
            );
        }
    }
}

#[async_trait::async_trait]
impl<C: Send + Sync + 'static> Runnable for StateMachineRunner<C> {
    async fn run(&self) -> Result<Value, RunError> {
        StateMachineRunner::run(self).await
    }

    async fn finished(&self) -> Result<Value, RunError> {
        StateMachineRunner::finished(self).await
    }

    fn cancel(&self) {
        StateMachineRunner::cancel(self);
    }

    fn subscribe(&self) -> broadcast::Receiver<RunnerNotice> {
        self.notices.subscribe()
    }
}

/// Build a runner from `config`, run it, and await the terminal value.
pub async fn run_machine<C: Send + Sync + 'static>(
    config: MachineConfig<C>,
    root_input: Value,
    sender: EventSender,
) -> Result<Value, RunError> {
    let runner = StateMachineRunner::new(config, root_input)?.with_sender(sender);
    runner.run().await
}
