//! The uniform contract shared by the DAG and state-machine runners.
//!
//! Both runners expose the same surface: `run()` drives the workflow to
//! completion, `finished()` is the completion future, `cancel()` requests
//! cooperative cancellation, and `subscribe()` yields coarse lifecycle
//! notices (`Finished` / `Cancelled` / `Error`).

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Errors produced by node and state bodies.
///
/// [`NodeError::Cancelled`] is the cancellation sentinel: the runner
/// treats it as clean early termination, not a failure — no error event
/// is emitted and no cascade is triggered.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Cancellation sentinel raised by `exit_if_cancelled`.
    #[error("cancelled")]
    #[diagnostic(code(trellis::node::cancelled))]
    Cancelled,

    /// Free-form failure from user code.
    #[error("{0}")]
    #[diagnostic(code(trellis::node::failed))]
    Message(String),

    /// JSON (de)serialization failure inside a body.
    #[error(transparent)]
    #[diagnostic(code(trellis::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Any other error a body chooses to surface.
    #[error(transparent)]
    #[diagnostic(code(trellis::node::other))]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl NodeError {
    /// Convenience constructor for message-only failures.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// `true` for the cancellation sentinel.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Cooperative cancellation probe handed to every node body.
///
/// There is no preemption: a body that never polls the probe runs to
/// completion, and the runner discards its output.
#[derive(Clone, Debug)]
pub struct CancelProbe {
    token: CancellationToken,
}

impl CancelProbe {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A probe that never fires, for driving bodies outside a runner.
    #[must_use]
    pub fn unused() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Has cancellation been requested?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out with the cancellation sentinel if cancellation was
    /// requested.
    ///
    /// ```ignore
    /// for chunk in work {
    ///     input.cancel.exit_if_cancelled()?;
    ///     process(chunk).await?;
    /// }
    /// ```
    pub fn exit_if_cancelled(&self) -> Result<(), NodeError> {
        if self.token.is_cancelled() {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested, for use in `select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Coarse lifecycle notices emitted by a runner to its subscribers.
#[derive(Clone, Debug)]
pub enum RunnerNotice {
    Finished(Value),
    Cancelled,
    Error(String),
}

/// Errors surfaced by a whole run.
#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    /// The run was cancelled before producing an output.
    #[error("run cancelled")]
    #[diagnostic(code(trellis::run::cancelled))]
    Cancelled,

    /// A node failed and the workflow does not tolerate failures.
    #[error("node {node} failed: {message}")]
    #[diagnostic(
        code(trellis::run::node_failed),
        help("Enable tolerate_failures to collect partial results instead.")
    )]
    NodeFailed { node: String, message: String },

    /// A state machine halted in error status with no error state to
    /// absorb the failure.
    #[error("state {state} failed: {message}")]
    #[diagnostic(code(trellis::run::state_failed))]
    StateFailed { state: String, message: String },

    /// The DAG definition failed validation.
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidDag(#[from] crate::dag::DagError),

    /// The state machine definition failed validation.
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidMachine(#[from] crate::machine::MachineError),
}

/// Terminal outcome of a run, shared between the completion future and
/// subscriber notices.
#[derive(Clone, Debug)]
pub(crate) enum Outcome {
    Finished(Value),
    Cancelled,
    Failed { node: String, message: String },
}

impl Outcome {
    pub(crate) fn into_dag_result(self) -> Result<Value, RunError> {
        match self {
            Outcome::Finished(value) => Ok(value),
            Outcome::Cancelled => Err(RunError::Cancelled),
            Outcome::Failed { node, message } => Err(RunError::NodeFailed { node, message }),
        }
    }

    pub(crate) fn into_machine_result(self) -> Result<Value, RunError> {
        match self {
            Outcome::Finished(value) => Ok(value),
            Outcome::Cancelled => Err(RunError::Cancelled),
            Outcome::Failed { node, message } => Err(RunError::StateFailed {
                state: node,
                message,
            }),
        }
    }

    pub(crate) fn notice(&self) -> RunnerNotice {
        match self {
            Outcome::Finished(value) => RunnerNotice::Finished(value.clone()),
            Outcome::Cancelled => RunnerNotice::Cancelled,
            Outcome::Failed { message, .. } => RunnerNotice::Error(message.clone()),
        }
    }
}

/// Write-once completion cell backing the `finished()` future.
///
/// The first resolution wins; later attempts are ignored so a cancel
/// racing a finish cannot flip the recorded outcome.
pub(crate) struct CompletionCell {
    tx: watch::Sender<Option<Outcome>>,
}

impl CompletionCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record the outcome. Returns `false` if already resolved.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn peek(&self) -> Option<Outcome> {
        self.tx.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> Outcome {
        let mut rx = self.tx.subscribe();
        let guard = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("completion sender lives as long as the runner");
        guard.clone().expect("checked by wait_for")
    }
}

/// Common surface shared by [`DagRunner`](crate::dag::DagRunner) and
/// [`StateMachineRunner`](crate::machine::StateMachineRunner).
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Launch the workflow and await its completion.
    async fn run(&self) -> Result<Value, RunError>;

    /// Completion future: resolves with the run's output, or rejects with
    /// the first error or the cancellation sentinel.
    async fn finished(&self) -> Result<Value, RunError>;

    /// Request cooperative cancellation.
    fn cancel(&self);

    /// Subscribe to coarse lifecycle notices.
    fn subscribe(&self) -> broadcast::Receiver<RunnerNotice>;
}
