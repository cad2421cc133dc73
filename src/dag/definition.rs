//! User-facing DAG definition types.
//!
//! A [`DagConfig`] is an immutable description of a workflow: a name, a
//! context factory, and a map of named nodes, each declaring its parents
//! and a body. Definitions are plain values; nothing runs until a
//! [`DagRunner`](super::DagRunner) is built from one.

use futures_util::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::context::StepHandle;
use crate::runnable::{CancelProbe, NodeError};

/// Type-erased node body.
pub type NodeBody<C> =
    Arc<dyn Fn(NodeInput<C>) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>;

/// Everything a node body receives when invoked.
///
/// `input` maps each parent's name to its output. A parent that failed
/// while this node tolerates parent errors contributes `Value::Null`.
pub struct NodeInput<C> {
    /// The workflow's shared context value.
    pub context: Arc<C>,
    /// Parents' outputs by parent name.
    pub input: FxHashMap<String, Value>,
    /// The external input supplied to the workflow as a whole.
    pub root_input: Value,
    /// Tracing handle for the node's step; metadata recorded here lands
    /// on the node's terminal event.
    pub span: StepHandle,
    /// Cooperative cancellation probe.
    pub cancel: CancelProbe,
}

impl<C> NodeInput<C> {
    /// Convenience accessor for one parent's output.
    #[must_use]
    pub fn parent(&self, name: &str) -> Option<&Value> {
        self.input.get(name)
    }
}

/// Descriptor for one DAG node.
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use trellis::dag::NodeConfig;
///
/// let node = NodeConfig::<()>::new(|input| async move {
///     let base = input.parent("fetch").and_then(|v| v.as_i64()).unwrap_or(0);
///     Ok(json!(base + 1))
/// })
/// .with_parent("fetch")
/// .with_semaphore_key("llm");
/// ```
pub struct NodeConfig<C> {
    pub(crate) parents: Vec<String>,
    pub(crate) semaphore_key: Option<String>,
    pub(crate) tolerate_parent_errors: bool,
    pub(crate) version: Option<String>,
    pub(crate) tags: Option<Vec<String>>,
    pub(crate) info: Option<Value>,
    pub(crate) body: NodeBody<C>,
}

impl<C> NodeConfig<C> {
    /// Create a node from its body.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(NodeInput<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        Self {
            parents: Vec::new(),
            semaphore_key: None,
            tolerate_parent_errors: false,
            version: None,
            tags: None,
            info: None,
            body: Arc::new(move |input| Box::pin(body(input))),
        }
    }

    /// Declare the ordered parent list. Empty parents make a root node.
    #[must_use]
    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    /// Append one parent.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    /// Rate-limit this node's body under the given semaphore key.
    #[must_use]
    pub fn with_semaphore_key(mut self, key: impl Into<String>) -> Self {
        self.semaphore_key = Some(key.into());
        self
    }

    /// Run even if a parent failed, receiving `Value::Null` in that
    /// parent's input slot instead of being cancelled.
    #[must_use]
    pub fn tolerate_parent_errors(mut self) -> Self {
        self.tolerate_parent_errors = true;
        self
    }

    /// Version tag mixed into the node's cache fingerprint. Bump it when
    /// the body's semantics change so stale cached outputs are bypassed.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Tags recorded on the node's start event.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Static annotations recorded on the node's start event.
    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    /// The node's cache fingerprint: its name plus declared version.
    pub(crate) fn fingerprint(&self, name: &str) -> String {
        match &self.version {
            Some(version) => format!("{name}@{version}"),
            None => name.to_string(),
        }
    }
}

/// Immutable definition of a whole DAG.
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use trellis::dag::{DagConfig, NodeConfig};
///
/// let dag = DagConfig::new("double", || ())
///     .add_node("source", NodeConfig::new(|input| async move {
///         Ok(input.root_input.clone())
///     }))
///     .add_node("double", NodeConfig::new(|input| async move {
///         let n = input.parent("source").and_then(|v| v.as_i64()).unwrap_or(0);
///         Ok(json!(n * 2))
///     }).with_parent("source"));
/// ```
pub struct DagConfig<C> {
    pub(crate) name: String,
    pub(crate) context_factory: Arc<dyn Fn() -> C + Send + Sync>,
    pub(crate) nodes: FxHashMap<String, Arc<NodeConfig<C>>>,
    pub(crate) tolerate_failures: bool,
    pub(crate) tags: Option<Vec<String>>,
    pub(crate) description: Option<String>,
}

impl<C> DagConfig<C> {
    /// Create a definition with a context factory invoked once per run.
    pub fn new<F>(name: impl Into<String>, context_factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            context_factory: Arc::new(context_factory),
            nodes: FxHashMap::default(),
            tolerate_failures: false,
            tags: None,
            description: None,
        }
    }

    /// Register a node under `name`.
    #[must_use]
    pub fn add_node(mut self, name: impl Into<String>, node: NodeConfig<C>) -> Self {
        self.nodes.insert(name.into(), Arc::new(node));
        self
    }

    /// Keep running independent subgraphs after a node failure and
    /// collect a (possibly partial) output.
    #[must_use]
    pub fn tolerate_failures(mut self) -> Self {
        self.tolerate_failures = true;
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The DAG's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
