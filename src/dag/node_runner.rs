//! Per-node lifecycle controller.
//!
//! Each node of a running DAG is owned by one `NodeRunner` driving the
//! state machine `waiting -> ready -> pendingSemaphore -> running ->
//! finished | error | cancelled`. Parent/child wiring uses completion
//! futures (`tokio::sync::watch`) rather than event subscription: the
//! event bus is for external observers only.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::definition::{NodeConfig, NodeInput};
use crate::cache::{cache_key, ResultCache};
use crate::context::{scoped, RunScope};
use crate::events::{EventData, EventType};
use crate::runnable::CancelProbe;
use crate::semaphores::{acquire_many, SemaphoreMap};

/// Lifecycle state of one node.
///
/// Transitions are monotonic except that `Waiting` and `Ready` may jump
/// straight to `Cancelled` (external cancel or parent error). Exactly one
/// of `Finished`, `Error`, `Cancelled` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Unsatisfied parents remain.
    Waiting,
    /// All parents done; parked until dispatched (manual mode only).
    Ready,
    /// Blocked acquiring the configured semaphore key.
    PendingSemaphore,
    Running,
    Finished,
    Error,
    Cancelled,
}

impl NodeState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::PendingSemaphore => "pendingSemaphore",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal resolution published to downstream subscribers.
///
/// `ParentError` is distinct from `Error` so diagnostics can separate a
/// cascade from its root cause.
#[derive(Clone, Debug)]
pub(crate) enum NodeResolution {
    Finished(Value),
    Error(String),
    ParentError,
    Cancelled,
}

/// Wait for the next terminal resolution among `pending` subscriptions.
///
/// Removes and returns the resolved entry. A subscription whose sender
/// vanished counts as `Cancelled`. Cancel-safe: dropping the future midway
/// removes nothing.
pub(crate) async fn next_resolution(
    pending: &mut Vec<(String, watch::Receiver<Option<NodeResolution>>)>,
) -> (String, NodeResolution) {
    debug_assert!(!pending.is_empty());
    let (idx, resolution) = {
        let futures = pending
            .iter_mut()
            .enumerate()
            .map(|(idx, (_, rx))| {
                Box::pin(async move {
                    let resolution = match rx.wait_for(Option::is_some).await {
                        Ok(guard) => guard.clone().expect("checked by wait_for"),
                        Err(_) => NodeResolution::Cancelled,
                    };
                    (idx, resolution)
                }) as futures_util::future::BoxFuture<'_, (usize, NodeResolution)>
            })
            .collect::<Vec<_>>();
        futures_util::future::select_all(futures).await.0
    };
    let (name, _) = pending.remove(idx);
    (name, resolution)
}

pub(crate) struct NodeRunner<C> {
    dag: String,
    name: String,
    config: Arc<NodeConfig<C>>,
    context: Arc<C>,
    root_input: Value,
    cache: Option<Arc<dyn ResultCache>>,
    semaphores: Vec<SemaphoreMap>,
    /// Dispatch automatically once parents settle; false parks in Ready.
    autorun: bool,
    /// Synthetic runners (the output collector) emit no events.
    silent: bool,
    /// Workflow-level scope; node steps are children of it.
    scope: RunScope,
    state: Mutex<NodeState>,
    inputs: Mutex<FxHashMap<String, Value>>,
    resolution: watch::Sender<Option<NodeResolution>>,
    cancel: CancellationToken,
    dispatch: Notify,
}

impl<C: Send + Sync + 'static> NodeRunner<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        dag: String,
        name: String,
        config: Arc<NodeConfig<C>>,
        context: Arc<C>,
        root_input: Value,
        cache: Option<Arc<dyn ResultCache>>,
        semaphores: Vec<SemaphoreMap>,
        autorun: bool,
        silent: bool,
        scope: RunScope,
        cancel: CancellationToken,
    ) -> Self {
        let (resolution, _) = watch::channel(None);
        Self {
            dag,
            name,
            config,
            context,
            root_input,
            cache,
            semaphores,
            autorun,
            silent,
            scope,
            state: Mutex::new(NodeState::Waiting),
            inputs: Mutex::new(FxHashMap::default()),
            resolution,
            cancel,
            dispatch: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn parents(&self) -> &[String] {
        &self.config.parents
    }

    pub(crate) fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Subscribe to this node's terminal resolution.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<NodeResolution>> {
        self.resolution.subscribe()
    }

    /// Request cancellation; the drive task performs the transition.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Release a node parked in `Ready` (manual mode).
    ///
    /// Returns false when the node is not ready, matching the "manual run
    /// on an unready node does nothing" contract.
    pub(crate) fn dispatch(&self) -> bool {
        if self.state() == NodeState::Ready {
            self.dispatch.notify_one();
            true
        } else {
            false
        }
    }

    fn set_state(&self, next: NodeState) {
        *self.state.lock() = next;
        tracing::debug!(target: "trellis::dag", dag = %self.dag, node = %self.name, state = %next, "node state");
        if !self.silent {
            self.scope.emit_data(
                EventType::DagNodeState,
                &self.name,
                EventData::NodeState {
                    state: next.as_str().to_string(),
                },
            );
        }
    }

    /// Terminal transition without event emission (cancellation paths).
    fn set_state_quiet(&self, next: NodeState) {
        *self.state.lock() = next;
        tracing::debug!(target: "trellis::dag", dag = %self.dag, node = %self.name, state = %next, "node state");
    }

    fn publish(&self, resolution: NodeResolution) {
        self.resolution.send_replace(Some(resolution));
    }

    fn resolve_cancelled(&self) {
        self.set_state_quiet(NodeState::Cancelled);
        self.publish(NodeResolution::Cancelled);
    }

    /// Drive this node to a terminal state.
    ///
    /// `parents` pairs each declared parent with a subscription to its
    /// resolution, in declaration order.
    pub(crate) async fn drive(
        self: Arc<Self>,
        parents: Vec<(String, watch::Receiver<Option<NodeResolution>>)>,
    ) {
        let mut pending = parents;
        while !pending.is_empty() {
            let (parent, resolution) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.resolve_cancelled();
                    return;
                }
                resolved = next_resolution(&mut pending) => resolved,
            };
            match resolution {
                NodeResolution::Finished(value) => {
                    self.inputs.lock().insert(parent, value);
                }
                _ if self.config.tolerate_parent_errors => {
                    // Failed parent contributes a null input slot.
                    self.inputs.lock().insert(parent, Value::Null);
                }
                NodeResolution::Error(_) | NodeResolution::ParentError => {
                    self.set_state_quiet(NodeState::Cancelled);
                    self.publish(NodeResolution::ParentError);
                    return;
                }
                NodeResolution::Cancelled => {
                    self.resolve_cancelled();
                    return;
                }
            }
        }

        if !self.autorun {
            self.set_state(NodeState::Ready);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.resolve_cancelled();
                    return;
                }
                _ = self.dispatch.notified() => {}
            }
        }

        self.execute().await;
    }

    async fn execute(&self) {
        let scope = self.scope.child_step();
        let span = scope
            .current_handle()
            .expect("child step allocates a handle")
            .clone();

        // Hold permits for the whole body; released on every exit path.
        let _permits = match &self.config.semaphore_key {
            Some(key) if !self.semaphores.is_empty() => {
                self.set_state(NodeState::PendingSemaphore);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.resolve_cancelled();
                        return;
                    }
                    permits = acquire_many(&self.semaphores, key) => Some(permits),
                }
            }
            _ => None,
        };

        self.set_state(NodeState::Running);
        let inputs = self.inputs.lock().clone();
        let input_value = Value::Object(inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        if !self.silent {
            scope.emit_start(
                EventType::DagNodeStart,
                &self.name,
                input_value.clone(),
                self.config.tags.clone(),
                self.config.info.clone(),
            );
        }

        let node_key = self
            .cache
            .as_ref()
            .map(|_| cache_key(&self.config.fingerprint(&self.name), &input_value, &self.root_input));

        let mut output = None;
        if let (Some(cache), Some(key)) = (&self.cache, &node_key) {
            match cache.get(&self.name, key).await {
                Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => {
                        span.record("cache_hit", Value::Bool(true));
                        output = Some(Ok(value));
                    }
                    Err(error) => {
                        tracing::warn!(target: "trellis::dag", node = %self.name, %error, "discarding undecodable cache entry");
                    }
                },
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(target: "trellis::dag", node = %self.name, %error, "cache read failed");
                }
            }
        }

        let output = match output {
            Some(hit) => hit,
            None => {
                let body_input = NodeInput {
                    context: Arc::clone(&self.context),
                    input: inputs,
                    root_input: self.root_input.clone(),
                    span,
                    cancel: CancelProbe::new(self.cancel.clone()),
                };
                let result = scoped(scope.clone(), (self.config.body)(body_input)).await;
                if let Ok(value) = &result {
                    if !self.cancel.is_cancelled() {
                        if let (Some(cache), Some(key)) = (&self.cache, &node_key) {
                            match serde_json::to_string(value) {
                                Ok(raw) => {
                                    if let Err(error) = cache.set(&self.name, key, raw).await {
                                        tracing::warn!(target: "trellis::dag", node = %self.name, %error, "cache write failed");
                                    }
                                }
                                Err(error) => {
                                    tracing::warn!(target: "trellis::dag", node = %self.name, %error, "output not cacheable");
                                }
                            }
                        }
                    }
                }
                result
            }
        };

        // A body that ignored cancellation still ran to completion; its
        // output is discarded and nothing further is emitted.
        if self.cancel.is_cancelled() {
            self.resolve_cancelled();
            return;
        }

        match output {
            Ok(value) => {
                if !self.silent {
                    scope.emit_end(EventType::DagNodeFinish, &self.name, value.clone());
                }
                self.set_state(NodeState::Finished);
                self.publish(NodeResolution::Finished(value));
            }
            Err(error) if error.is_cancelled() => {
                self.resolve_cancelled();
            }
            Err(error) => {
                let message = error.to_string();
                if !self.silent {
                    scope.emit_error(EventType::DagNodeError, &self.name, &message);
                }
                self.set_state(NodeState::Error);
                self.publish(NodeResolution::Error(message));
            }
        }
    }
}
