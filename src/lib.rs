//! ```text
//! DagConfig ──► DagRunner ──► NodeRunners ──► node bodies
//!                  │               │             │
//!                  │               │             ├─► SemaphoreMap (rate limits)
//!                  │               │             └─► ResultCache (memoisation)
//!                  │               └─► resolutions → downstream nodes
//!                  │
//! MachineConfig ─► StateMachineRunner ─► state bodies + guarded transitions
//!                  │
//!                  └─► RunScope (run/step ids) ─► EventBus ─► sinks
//! ```
//!
//! Trellis is a workflow orchestration core with two composable execution
//! models — a directed-acyclic-graph runner and a hierarchical
//! state-machine runner — unified under one step-tracing substrate that
//! assigns causally-linked UUIDv7 identifiers, emits structured lifecycle
//! events, respects cooperative cancellation, and coordinates shared
//! resource limits through keyed multi-semaphore acquisition.

pub mod cache;
pub mod context;
pub mod dag;
pub mod events;
pub mod machine;
pub mod runnable;
pub mod semaphores;
pub mod types;

pub use cache::{InMemoryCache, ResultCache};
pub use context::{
    as_step, current_scope, log_event, record_step_info, run_step, scoped, start_run, RunOptions,
    RunScope, StepHandle, StepOptions,
};
pub use dag::{run_dag, DagConfig, DagRunner, NodeConfig, NodeInput};
pub use events::{EventBus, EventSender, EventType, StepEvent};
pub use machine::{run_machine, MachineConfig, MachineEvent, StateConfig, StateMachineRunner};
pub use runnable::{CancelProbe, NodeError, RunError, Runnable, RunnerNotice};
pub use semaphores::{acquire_many, SemaphoreMap};
pub use types::{RunId, StepId};
