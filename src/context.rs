//! Ambient run context: causally-linked step ids and event emission.
//!
//! Every workflow invocation happens inside a [`RunScope`] carrying the
//! run id, the enclosing workflow name, and the current/parent step ids.
//! The scope lives in a [`tokio::task_local!`] cell, so user code deep
//! inside a node body can emit events or attach step metadata without
//! threading a context argument through every call.
//!
//! Task-locals do not cross `tokio::spawn` boundaries. Runners snapshot
//! the scope with [`current_scope`] and re-establish it inside each
//! spawned task via [`scoped`], which is what guarantees that N concurrent
//! sub-operations launched from step A all observe A as their parent.
//!
//! # Examples
//!
//! ```rust
//! use serde_json::json;
//! use trellis::context::{run_step, start_run, RunOptions, StepOptions};
//! use trellis::events::EventSender;
//!
//! # async fn demo() -> Result<(), std::convert::Infallible> {
//! start_run(RunOptions::new("demo", EventSender::disconnected()), async {
//!     run_step(StepOptions::new("fetch").with_input(json!({"url": "x"})), async {
//!         Ok::<_, std::convert::Infallible>(42)
//!     })
//!     .await
//! })
//! .await
//! # .map(|_| ())
//! # }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::events::{
    EventData, EventSender, EventType, StepEndData, StepEvent, StepStartData,
};
use crate::types::{RunId, StepId};

tokio::task_local! {
    static CURRENT_SCOPE: RunScope;
}

/// Handle to one live step: its id, start time, and post-hoc metadata.
///
/// A clone of this handle is what node bodies receive as their `span`
/// parameter; [`StepHandle::record`] attaches metadata that lands in the
/// `info` field of the step's terminal event.
#[derive(Clone, Debug)]
pub struct StepHandle {
    step: StepId,
    started: DateTime<Utc>,
    info: Arc<Mutex<serde_json::Map<String, Value>>>,
}

impl StepHandle {
    fn new() -> Self {
        Self {
            step: StepId::new(),
            started: Utc::now(),
            info: Arc::new(Mutex::new(serde_json::Map::new())),
        }
    }

    /// The id of this step.
    #[must_use]
    pub fn step(&self) -> &StepId {
        &self.step
    }

    /// Attach one key of metadata to the step's terminal event.
    pub fn record(&self, key: impl Into<String>, value: Value) {
        self.info.lock().insert(key.into(), value);
    }

    /// Merge an object of metadata into the step's terminal event.
    ///
    /// Non-object values are stored under the `"info"` key.
    pub fn record_info(&self, value: Value) {
        let mut guard = self.info.lock();
        match value {
            Value::Object(map) => guard.extend(map),
            other => {
                guard.insert("info".to_string(), other);
            }
        }
    }

    fn take_info(&self) -> Option<Value> {
        let guard = self.info.lock();
        if guard.is_empty() {
            None
        } else {
            Some(Value::Object(guard.clone()))
        }
    }
}

/// Ambient scoped record: who is running, under which step.
///
/// Children inherit every field of their parent except `parent_step`
/// (which becomes the outer current step) and the current step handle
/// (freshly allocated per step).
#[derive(Clone, Debug)]
pub struct RunScope {
    run_id: RunId,
    source: Arc<String>,
    parent_step: Option<StepId>,
    current: Option<StepHandle>,
    sender: EventSender,
    meta: Option<Value>,
}

impl RunScope {
    /// Root scope for a run driven outside `start_run` (e.g. a state
    /// machine stepped manually).
    pub(crate) fn root(source: String, sender: EventSender) -> Self {
        Self::new(RunId::new(), source, sender, None)
    }

    fn new(run_id: RunId, source: String, sender: EventSender, meta: Option<Value>) -> Self {
        Self {
            run_id,
            source: Arc::new(source),
            parent_step: None,
            current: None,
            sender,
            meta,
        }
    }

    /// Stable id of the outermost workflow run.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Human name of the enclosing workflow.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Step id of the enclosing step, if any.
    #[must_use]
    pub fn parent_step(&self) -> Option<&StepId> {
        self.parent_step.as_ref()
    }

    /// Step id of the innermost active step, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<&StepId> {
        self.current.as_ref().map(StepHandle::step)
    }

    /// Handle of the innermost active step, if any.
    #[must_use]
    pub fn current_handle(&self) -> Option<&StepHandle> {
        self.current.as_ref()
    }

    /// The event sender this scope emits through.
    #[must_use]
    pub fn sender(&self) -> &EventSender {
        &self.sender
    }

    /// Per-run metadata forwarded verbatim onto every event.
    #[must_use]
    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Derive the scope for a child step: the current step becomes the
    /// parent, and a fresh step handle is allocated.
    #[must_use]
    pub fn child_step(&self) -> RunScope {
        RunScope {
            run_id: self.run_id.clone(),
            source: Arc::clone(&self.source),
            parent_step: self.current_step().cloned(),
            current: Some(StepHandle::new()),
            sender: self.sender.clone(),
            meta: self.meta.clone(),
        }
    }

    /// Like [`child_step`](Self::child_step), renaming the workflow for
    /// events emitted under the child (used when a nested workflow runs
    /// inside an outer run).
    #[must_use]
    pub fn child_for(&self, source: impl Into<String>) -> RunScope {
        let mut child = self.child_step();
        child.source = Arc::new(source.into());
        child
    }

    fn event_step(&self) -> StepId {
        self.current_step().cloned().unwrap_or_else(StepId::new)
    }

    /// Emit a `*_start` event for the current step.
    pub(crate) fn emit_start(
        &self,
        event_type: EventType,
        source_node: &str,
        input: Value,
        tags: Option<Vec<String>>,
        info: Option<Value>,
    ) {
        let started = self
            .current
            .as_ref()
            .map(|h| h.started)
            .unwrap_or_else(Utc::now);
        self.sender.send(StepEvent {
            event_type,
            run_id: self.run_id.clone(),
            step: self.event_step(),
            source: self.source.to_string(),
            source_node: source_node.to_string(),
            start_time: started,
            end_time: None,
            data: EventData::Start(StepStartData {
                parent_step: self.parent_step.clone(),
                span_id: None,
                tags,
                info,
                input,
            }),
            meta: self.meta.clone(),
        });
    }

    /// Emit a `*_finish` / `step:end` event, merging recorded step info.
    pub(crate) fn emit_end(&self, event_type: EventType, source_node: &str, output: Value) {
        let (started, info) = match &self.current {
            Some(handle) => (handle.started, handle.take_info()),
            None => (Utc::now(), None),
        };
        self.sender.send(StepEvent {
            event_type,
            run_id: self.run_id.clone(),
            step: self.event_step(),
            source: self.source.to_string(),
            source_node: source_node.to_string(),
            start_time: started,
            end_time: Some(Utc::now()),
            data: EventData::End(StepEndData { output, info }),
            meta: self.meta.clone(),
        });
    }

    /// Emit a `*:error` event for the current step.
    pub(crate) fn emit_error(&self, event_type: EventType, source_node: &str, error: &str) {
        let started = self
            .current
            .as_ref()
            .map(|h| h.started)
            .unwrap_or_else(Utc::now);
        self.sender.send(StepEvent {
            event_type,
            run_id: self.run_id.clone(),
            step: self.event_step(),
            source: self.source.to_string(),
            source_node: source_node.to_string(),
            start_time: started,
            end_time: Some(Utc::now()),
            data: EventData::Error {
                error: error.to_string(),
            },
            meta: self.meta.clone(),
        });
    }

    /// Emit a non-lifecycle framework event (state snapshots, transitions).
    pub(crate) fn emit_data(&self, event_type: EventType, source_node: &str, data: EventData) {
        self.sender.send(StepEvent {
            event_type,
            run_id: self.run_id.clone(),
            step: self.event_step(),
            source: self.source.to_string(),
            source_node: source_node.to_string(),
            start_time: Utc::now(),
            end_time: None,
            data,
            meta: self.meta.clone(),
        });
    }

    /// Emit a user event; `run_id`, `step`, and `source` are filled from
    /// this scope, so sinks never observe an orphaned event.
    pub fn emit_user(&self, tag: &str, data: Value) {
        self.emit_data(
            EventType::from_tag(tag),
            "",
            EventData::User(data),
        );
    }
}

/// Options for [`start_run`].
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Human name of the workflow this run executes.
    pub name: String,
    /// Run id to revive; a fresh UUIDv7 is allocated when absent.
    pub run_id: Option<RunId>,
    /// Allocate a fresh context even when one is already ambient.
    pub force_new_context: bool,
    /// Metadata bag forwarded verbatim on every event of the run.
    pub meta: Option<Value>,
    /// Sink for outgoing events.
    pub sender: EventSender,
}

impl RunOptions {
    pub fn new(name: impl Into<String>, sender: EventSender) -> Self {
        Self {
            name: name.into(),
            run_id: None,
            force_new_context: false,
            meta: None,
            sender,
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[must_use]
    pub fn force_new_context(mut self) -> Self {
        self.force_new_context = true;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Options for [`run_step`].
#[derive(Clone, Debug, Default)]
pub struct StepOptions {
    /// Step name, recorded as the event's `sourceNode`.
    pub name: String,
    /// Step input, recorded on the `step:start` event.
    pub input: Value,
    /// Suppress `step:*` event emission (the step id is still allocated).
    pub skip_logging: bool,
    pub tags: Option<Vec<String>>,
    pub info: Option<Value>,
}

impl StepOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }
}

/// Establish (or inherit) an ambient run context around `fut`.
///
/// If a context is already ambient and `force_new_context` is unset, the
/// future runs in the existing context unchanged. Otherwise a fresh scope
/// is allocated with a new run id (or the one supplied for revival).
pub async fn start_run<T, Fut>(options: RunOptions, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    if !options.force_new_context && CURRENT_SCOPE.try_with(|_| ()).is_ok() {
        return fut.await;
    }
    let scope = RunScope::new(
        options.run_id.unwrap_or_default(),
        options.name,
        options.sender,
        options.meta,
    );
    CURRENT_SCOPE.scope(scope, fut).await
}

/// Run `fut` as a named step of the ambient run.
///
/// Allocates a child step id (the outer current step becomes the parent),
/// emits `step:start` before the body and exactly one of `step:end` /
/// `step:error` after it, unless `skip_logging` is set. The body may call
/// [`record_step_info`] to attach metadata to the terminal event.
///
/// Outside any run context the body executes untraced.
pub async fn run_step<T, E, Fut>(options: StepOptions, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    T: Serialize,
    E: fmt::Display,
{
    let Some(scope) = current_scope() else {
        tracing::warn!(
            target: "trellis::context",
            step = %options.name,
            "run_step called outside start_run; running untraced"
        );
        return fut.await;
    };
    let child = scope.child_step();
    if !options.skip_logging {
        child.emit_start(
            EventType::StepStart,
            &options.name,
            options.input.clone(),
            options.tags.clone(),
            options.info.clone(),
        );
    }
    let result = CURRENT_SCOPE.scope(child.clone(), fut).await;
    if !options.skip_logging {
        match &result {
            Ok(value) => {
                let output = serde_json::to_value(value).unwrap_or(Value::Null);
                child.emit_end(EventType::StepEnd, &options.name, output);
            }
            Err(error) => {
                child.emit_error(EventType::StepError, &options.name, &error.to_string());
            }
        }
    }
    result
}

/// Wrap a single-argument async function so every call runs as a step
/// named `name`, with the call argument recorded as the step input.
pub fn as_step<I, T, E, F, Fut>(
    name: impl Into<String>,
    f: F,
) -> impl Fn(I) -> futures_util::future::BoxFuture<'static, Result<T, E>> + Clone
where
    I: Serialize + Send + 'static,
    T: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
    F: Fn(I) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let name = name.into();
    move |arg: I| {
        let f = f.clone();
        let name = name.clone();
        Box::pin(async move {
            let input = serde_json::to_value(&arg).unwrap_or(Value::Null);
            run_step(StepOptions::new(name).with_input(input), f(arg)).await
        })
    }
}

/// Snapshot the ambient scope, if any.
///
/// Use together with [`scoped`] to forward the context into spawned tasks.
#[must_use]
pub fn current_scope() -> Option<RunScope> {
    CURRENT_SCOPE.try_with(|scope| scope.clone()).ok()
}

/// Run `fut` with `scope` as the ambient context.
pub fn scoped<Fut: Future>(scope: RunScope, fut: Fut) -> impl Future<Output = Fut::Output> {
    CURRENT_SCOPE.scope(scope, fut)
}

/// Attach metadata to the terminal event of the innermost active step.
///
/// No-op outside a step.
pub fn record_step_info(value: Value) {
    let _ = CURRENT_SCOPE.try_with(|scope| {
        if let Some(handle) = scope.current_handle() {
            handle.record_info(value);
        }
    });
}

/// Emit a user event through the ambient scope.
///
/// Returns `false` when no context is ambient (the event is dropped).
pub fn log_event(tag: &str, data: Value) -> bool {
    CURRENT_SCOPE
        .try_with(|scope| scope.emit_user(tag, data))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, MemorySink};
    use serde_json::json;

    #[tokio::test]
    async fn test_step_events_pair_with_same_step_id() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        start_run(RunOptions::new("paired", bus.get_sender()), async {
            run_step(StepOptions::new("work").with_input(json!(7)), async {
                Ok::<_, std::convert::Infallible>(json!(8))
            })
            .await
            .unwrap();
        })
        .await;
        bus.flush().await;

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::StepStart);
        assert_eq!(events[1].event_type, EventType::StepEnd);
        assert_eq!(events[0].step, events[1].step);
        assert_eq!(events[0].run_id, events[1].run_id);
        assert!(events[0].start_time <= events[1].end_time.unwrap());
        bus.stop_listener().await;
    }

    #[tokio::test]
    async fn test_nested_steps_link_parents() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        start_run(RunOptions::new("nested", bus.get_sender()), async {
            run_step(StepOptions::new("outer"), async {
                run_step(StepOptions::new("inner"), async {
                    Ok::<_, std::convert::Infallible>(json!(null))
                })
                .await
            })
            .await
            .unwrap();
        })
        .await;
        bus.flush().await;

        let events = sink.snapshot();
        let outer_start = events
            .iter()
            .find(|e| e.source_node == "outer" && e.event_type == EventType::StepStart)
            .unwrap();
        let inner_start = events
            .iter()
            .find(|e| e.source_node == "inner" && e.event_type == EventType::StepStart)
            .unwrap();
        match &inner_start.data {
            EventData::Start(data) => {
                assert_eq!(data.parent_step.as_ref(), Some(&outer_start.step));
            }
            other => panic!("expected start data, got {other:?}"),
        }
        bus.stop_listener().await;
    }

    #[tokio::test]
    async fn test_step_error_event_on_failure() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        start_run(RunOptions::new("failing", bus.get_sender()), async {
            let result: Result<Value, String> =
                run_step(StepOptions::new("boom"), async { Err("kaput".to_string()) }).await;
            assert!(result.is_err());
        })
        .await;
        bus.flush().await;

        let events = sink.snapshot();
        assert_eq!(events[1].event_type, EventType::StepError);
        match &events[1].data {
            EventData::Error { error } => assert_eq!(error, "kaput"),
            other => panic!("expected error data, got {other:?}"),
        }
        bus.stop_listener().await;
    }

    #[tokio::test]
    async fn test_record_step_info_lands_on_end_event() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        start_run(RunOptions::new("annotated", bus.get_sender()), async {
            run_step(StepOptions::new("work"), async {
                record_step_info(json!({"cache_hit": true}));
                Ok::<_, std::convert::Infallible>(json!(1))
            })
            .await
            .unwrap();
        })
        .await;
        bus.flush().await;

        let events = sink.snapshot();
        match &events[1].data {
            EventData::End(data) => {
                assert_eq!(data.info, Some(json!({"cache_hit": true})));
            }
            other => panic!("expected end data, got {other:?}"),
        }
        bus.stop_listener().await;
    }

    #[tokio::test]
    async fn test_existing_context_is_inherited() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        start_run(RunOptions::new("outer", bus.get_sender()), async {
            let outer_run = current_scope().unwrap().run_id().clone();
            // Nested start_run without force_new_context keeps the run id.
            start_run(
                RunOptions::new("inner", EventSender::disconnected()),
                async move {
                    assert_eq!(current_scope().unwrap().run_id(), &outer_run);
                },
            )
            .await;
        })
        .await;
        bus.stop_listener().await;
    }

    #[tokio::test]
    async fn test_scope_survives_spawn_when_forwarded() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        start_run(RunOptions::new("spawning", bus.get_sender()), async {
            run_step(StepOptions::new("parent").skip_logging(), async {
                let snapshot = current_scope().unwrap();
                let parent = snapshot.current_step().cloned();
                let handle = tokio::spawn(scoped(snapshot, async move {
                    let inner = current_scope().unwrap();
                    assert_eq!(inner.current_step().cloned(), parent);
                }));
                handle.await.unwrap();
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .unwrap();
        })
        .await;
        bus.stop_listener().await;
    }
}
