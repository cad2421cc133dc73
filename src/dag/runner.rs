//! Whole-DAG orchestration.
//!
//! `DagRunner` compiles a [`DagConfig`], builds one
//! [`NodeRunner`](super::node_runner::NodeRunner) per node plus a
//! synthetic output collector over the leaf set, wires parent/child
//! resolution channels, and supervises execution: fanning out roots,
//! propagating the first error (unless failures are tolerated), and
//! cancelling the rest.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::compile::{compile, CompiledGraph, DagError};
use super::definition::{DagConfig, NodeConfig, NodeInput};
use super::node_runner::{next_resolution, NodeResolution, NodeRunner, NodeState};
use crate::cache::ResultCache;
use crate::context::{current_scope, start_run, RunOptions, RunScope};
use crate::events::{EventBus, EventSender, EventType};
use crate::runnable::{CompletionCell, Outcome, RunError, Runnable, RunnerNotice};
use crate::semaphores::SemaphoreMap;

/// Name of the synthetic collector node appended over the DAG's leaves.
pub const OUTPUT_NODE: &str = "__output";

/// Executes one DAG definition against one root input.
///
/// # Examples
///
/// ```rust,no_run
/// use serde_json::json;
/// use trellis::dag::{DagConfig, DagRunner, NodeConfig};
/// use trellis::events::EventBus;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let dag = DagConfig::new("greet", || ()).add_node(
///     "hello",
///     NodeConfig::new(|input| async move {
///         let name = input.root_input.as_str().unwrap_or_default();
///         Ok(json!(format!("hello {name}")))
///     }),
/// );
///
/// let bus = EventBus::default();
/// bus.listen_for_events();
/// let runner = DagRunner::new(dag, json!("world"))?.with_events(&bus);
/// let output = runner.run().await?;
/// assert_eq!(output, json!("hello world"));
/// # Ok(())
/// # }
/// ```
pub struct DagRunner<C> {
    config: DagConfig<C>,
    compiled: CompiledGraph,
    context: Arc<C>,
    root_input: Value,
    cache: Option<Arc<dyn ResultCache>>,
    semaphores: Vec<SemaphoreMap>,
    sender: EventSender,
    autorun: bool,
    cancel: CancellationToken,
    completion: CompletionCell,
    notices: broadcast::Sender<RunnerNotice>,
    runners: Mutex<FxHashMap<String, Arc<NodeRunner<C>>>>,
    started: AtomicBool,
}

impl<C: Send + Sync + 'static> DagRunner<C> {
    /// Compile the definition and prepare a runner.
    ///
    /// All construction errors (empty DAG, unknown parent, cycle) surface
    /// here; a runner in hand is always structurally valid.
    pub fn new(config: DagConfig<C>, root_input: Value) -> Result<Self, DagError> {
        let compiled = compile(&config.nodes)?;
        let context = Arc::new((config.context_factory)());
        let (notices, _) = broadcast::channel(16);
        Ok(Self {
            config,
            compiled,
            context,
            root_input,
            cache: None,
            semaphores: Vec::new(),
            sender: EventSender::disconnected(),
            autorun: true,
            cancel: CancellationToken::new(),
            completion: CompletionCell::new(),
            notices,
            runners: Mutex::new(FxHashMap::default()),
            started: AtomicBool::new(false),
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

    /// Memoise node outputs in `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Rate-limit nodes that declare a `semaphore_key` against these maps.
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

    /// Manual dispatch mode: nodes whose parents settle park in `Ready`
    /// until [`dispatch`](Self::dispatch) is called for them.
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.autorun = false;
        self
    }

    /// The compiled root set.
    #[must_use]
    pub fn roots(&self) -> &[String] {
        &self.compiled.roots
    }

    /// The compiled leaf set.
    #[must_use]
    pub fn leaves(&self) -> &[String] {
        &self.compiled.leaves
    }

    /// The shared context value node bodies observe.
    #[must_use]
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Current state of one node, once the run has started.
    #[must_use]
    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.runners.lock().get(node).map(|runner| runner.state())
    }

    /// Nodes currently parked in `Ready` (manual mode).
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<String> {
        self.runners
            .lock()
            .values()
            .filter(|runner| runner.state() == NodeState::Ready)
            .map(|runner| runner.name().to_string())
            .collect()
    }

    /// Release one `Ready` node (manual mode). Returns false when the
    /// node is unknown or not ready.
    pub fn dispatch(&self, node: &str) -> bool {
        self.runners
            .lock()
            .get(node)
            .is_some_and(|runner| runner.dispatch())
    }

    /// Launch without awaiting; completion is observable via
    /// [`Runnable::finished`].
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            let _ = self.run().await;
        });
    }

    /// Run the DAG and await its output.
    ///
    /// A second call (or a call racing `start`) awaits the same outcome.
    #[instrument(skip(self), fields(dag = %self.config.name))]
    pub async fn run(&self) -> Result<Value, RunError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.completion.wait().await.into_dag_result();
        }
        let options = RunOptions::new(self.config.name.clone(), self.sender.clone());
        let outcome = start_run(options, self.execute()).await;
        self.completion.resolve(outcome.clone());
        let _ = self.notices.send(outcome.notice());
        outcome.into_dag_result()
    }

    async fn execute(&self) -> Outcome {
        let outer = current_scope().expect("start_run establishes a scope");
        let workflow = outer.child_for(self.config.name.clone());
        workflow.emit_start(EventType::DagStart, "", self.root_input.clone(), None, None);

        let (runners, output_runner) = self.build_runners(&workflow);
        let mut tasks = tokio::task::JoinSet::new();
        let mut watching: Vec<(String, watch::Receiver<Option<NodeResolution>>)> = Vec::new();

        for runner in runners.values().chain(std::iter::once(&output_runner)) {
            let parents: Vec<(String, watch::Receiver<Option<NodeResolution>>)> = runner
                .parents()
                .iter()
                .map(|parent| (parent.clone(), runners[parent].subscribe()))
                .collect();
            watching.push((runner.name().to_string(), runner.subscribe()));
            tasks.spawn(Arc::clone(runner).drive(parents));
        }

        {
            let mut registry = self.runners.lock();
            registry.extend(runners.clone());
            registry.insert(OUTPUT_NODE.to_string(), Arc::clone(&output_runner));
        }

        let mut outcome = None;
        while outcome.is_none() && !watching.is_empty() {
            let (node, resolution) = next_resolution(&mut watching).await;
            if node == OUTPUT_NODE {
                outcome = Some(match resolution {
                    NodeResolution::Finished(value) => {
                        workflow.emit_end(EventType::DagFinish, "", value.clone());
                        Outcome::Finished(value)
                    }
                    NodeResolution::Error(message) => {
                        workflow.emit_error(EventType::DagError, "", &message);
                        Outcome::Failed {
                            node: OUTPUT_NODE.to_string(),
                            message,
                        }
                    }
                    NodeResolution::ParentError | NodeResolution::Cancelled => Outcome::Cancelled,
                });
            } else if let NodeResolution::Error(message) = resolution {
                if !self.config.tolerate_failures {
                    workflow.emit_error(EventType::DagError, "", &message);
                    self.cancel.cancel();
                    outcome = Some(Outcome::Failed { node, message });
                }
            }
        }

        // Quiesce: every node task reaches a terminal state before the
        // outcome is published.
        while tasks.join_next().await.is_some() {}

        outcome.unwrap_or(Outcome::Cancelled)
    }

    fn build_runners(
        &self,
        workflow: &RunScope,
    ) -> (FxHashMap<String, Arc<NodeRunner<C>>>, Arc<NodeRunner<C>>) {
        let mut runners = FxHashMap::default();
        for (name, node) in &self.config.nodes {
            runners.insert(
                name.clone(),
                Arc::new(NodeRunner::new(
                    self.config.name.clone(),
                    name.clone(),
                    Arc::clone(node),
                    Arc::clone(&self.context),
                    self.root_input.clone(),
                    self.cache.clone(),
                    self.semaphores.clone(),
                    self.autorun,
                    false,
                    workflow.clone(),
                    self.cancel.child_token(),
                )),
            );
        }

        // Collector over the leaves: a single leaf's output passes
        // through unwrapped, multiple leaves yield the name-keyed map.
        // Tolerates parent errors so partial runs still produce output.
        let collector = NodeConfig::new(|input: NodeInput<C>| async move {
            let mut map = serde_json::Map::new();
            for (name, value) in input.input {
                map.insert(name, value);
            }
            if map.len() == 1 {
                Ok(map.into_iter().next().map(|(_, value)| value).unwrap_or(Value::Null))
            } else {
                Ok(Value::Object(map))
            }
        })
        .with_parents(self.compiled.leaves.clone())
        .tolerate_parent_errors();

        let output_runner = Arc::new(NodeRunner::new(
            self.config.name.clone(),
            OUTPUT_NODE.to_string(),
            Arc::new(collector),
            Arc::clone(&self.context),
            self.root_input.clone(),
            None,
            Vec::new(),
            true,
            true,
            workflow.clone(),
            self.cancel.child_token(),
        ));
        (runners, output_runner)
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> Runnable for DagRunner<C> {
    async fn run(&self) -> Result<Value, RunError> {
        DagRunner::run(self).await
    }

    async fn finished(&self) -> Result<Value, RunError> {
        self.completion.wait().await.into_dag_result()
    }

    fn cancel(&self) {
        self.cancel.cancel();
        for runner in self.runners.lock().values() {
            runner.cancel();
        }
        // A started run reports the cancellation when it settles; an
        // unstarted one must resolve here or `finished` would hang.
        if !self.started.load(Ordering::SeqCst) {
            self.completion.resolve(Outcome::Cancelled);
            let _ = self.notices.send(RunnerNotice::Cancelled);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RunnerNotice> {
        self.notices.subscribe()
    }
}

/// Build a runner from `config`, run it, and await the output.
///
/// This is the awaiting public helper; [`DagRunner::start`] remains the
/// lower-level non-awaiting entry point.
pub async fn run_dag<C: Send + Sync + 'static>(
    config: DagConfig<C>,
    root_input: Value,
    sender: EventSender,
) -> Result<Value, RunError> {
    let runner = DagRunner::new(config, root_input)?.with_sender(sender);
    runner.run().await
}
