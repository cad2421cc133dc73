//! DAG validation: root/leaf discovery, unknown parents, cycle detection.
//!
//! Compilation happens when a runner is constructed; a malformed graph
//! never reaches scheduling.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

use super::definition::NodeConfig;

/// Construction-time DAG errors.
#[derive(Debug, Error, Diagnostic)]
pub enum DagError {
    #[error("DAG has no nodes")]
    #[diagnostic(
        code(trellis::dag::empty),
        help("Add at least one node before building a runner.")
    )]
    NoNodes,

    #[error("node {node} references unknown parent {parent}")]
    #[diagnostic(
        code(trellis::dag::unknown_parent),
        help("Every name in a node's parents list must itself be a node.")
    )]
    UnknownParent { node: String, parent: String },

    #[error("DAG contains a cycle: {path}")]
    #[diagnostic(code(trellis::dag::cycle))]
    Cycle { path: String },
}

/// Structural summary of a validated DAG.
#[derive(Clone, Debug)]
pub struct CompiledGraph {
    /// Nodes with no parents, sorted by name.
    pub roots: Vec<String>,
    /// Nodes no other node depends on, sorted by name.
    pub leaves: Vec<String>,
}

/// Validate the node map and compute its root and leaf sets.
///
/// Starts with every node as a leaf candidate and walks each node's
/// ancestry depth-first, discarding every visited parent from the leaf
/// set. A node encountered while already on the current path is a cycle,
/// reported with its full path.
pub fn compile<C>(
    nodes: &FxHashMap<String, Arc<NodeConfig<C>>>,
) -> Result<CompiledGraph, DagError> {
    if nodes.is_empty() {
        return Err(DagError::NoNodes);
    }

    let mut leaves: FxHashSet<&str> = nodes.keys().map(String::as_str).collect();
    let mut done: FxHashSet<&str> = FxHashSet::default();
    let mut path: Vec<&str> = Vec::new();

    for name in nodes.keys() {
        visit(name, nodes, &mut leaves, &mut done, &mut path)?;
    }

    let mut roots: Vec<String> = nodes
        .iter()
        .filter(|(_, node)| node.parents.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    roots.sort_unstable();

    let mut leaves: Vec<String> = leaves.into_iter().map(str::to_string).collect();
    leaves.sort_unstable();

    Ok(CompiledGraph { roots, leaves })
}

fn visit<'a, C>(
    name: &'a str,
    nodes: &'a FxHashMap<String, Arc<NodeConfig<C>>>,
    leaves: &mut FxHashSet<&'a str>,
    done: &mut FxHashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Result<(), DagError> {
    if let Some(position) = path.iter().position(|on_path| *on_path == name) {
        let mut cycle: Vec<&str> = path[position..].to_vec();
        cycle.push(name);
        return Err(DagError::Cycle {
            path: cycle.join(" -> "),
        });
    }
    if done.contains(name) {
        return Ok(());
    }

    path.push(name);
    let node = &nodes[name];
    for parent in &node.parents {
        let Some((parent_key, _)) = nodes.get_key_value(parent) else {
            return Err(DagError::UnknownParent {
                node: name.to_string(),
                parent: parent.clone(),
            });
        };
        leaves.remove(parent_key.as_str());
        visit(parent_key, nodes, leaves, done, path)?;
    }
    path.pop();
    done.insert(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::definition::NodeInput;
    use serde_json::Value;

    fn node(parents: &[&str]) -> Arc<NodeConfig<()>> {
        Arc::new(
            NodeConfig::new(|_input: NodeInput<()>| async { Ok(Value::Null) })
                .with_parents(parents.iter().copied()),
        )
    }

    fn graph(edges: &[(&str, &[&str])]) -> FxHashMap<String, Arc<NodeConfig<()>>> {
        edges
            .iter()
            .map(|(name, parents)| (name.to_string(), node(parents)))
            .collect()
    }

    #[test]
    fn test_empty_graph_is_rejected() {
        let nodes: FxHashMap<String, Arc<NodeConfig<()>>> = FxHashMap::default();
        let err = compile(&nodes).unwrap_err();
        assert!(err.to_string().contains("DAG has no nodes"));
    }

    #[test]
    fn test_diamond_roots_and_leaves() {
        let nodes = graph(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("join", &["left", "right"]),
        ]);
        let compiled = compile(&nodes).unwrap();
        assert_eq!(compiled.roots, vec!["root"]);
        assert_eq!(compiled.leaves, vec!["join"]);
    }

    #[test]
    fn test_multiple_roots_and_leaves() {
        let nodes = graph(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &["a"]),
            ("d", &["b"]),
        ]);
        let compiled = compile(&nodes).unwrap();
        assert_eq!(compiled.roots, vec!["a", "b"]);
        assert_eq!(compiled.leaves, vec!["c", "d"]);
    }

    #[test]
    fn test_unknown_parent_names_child_and_parent() {
        let nodes = graph(&[("child", &["ghost"])]);
        match compile(&nodes) {
            Err(DagError::UnknownParent { node, parent }) => {
                assert_eq!(node, "child");
                assert_eq!(parent, "ghost");
            }
            other => panic!("expected UnknownParent, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let nodes = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        match compile(&nodes) {
            Err(DagError::Cycle { path }) => {
                // The path closes on its starting node.
                let hops: Vec<&str> = path.split(" -> ").collect();
                assert_eq!(hops.len(), 4);
                assert_eq!(hops.first(), hops.last());
                for node in ["a", "b", "c"] {
                    assert!(path.contains(node), "path {path} should contain {node}");
                }
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        let nodes = graph(&[("selfish", &["selfish"])]);
        match compile(&nodes) {
            Err(DagError::Cycle { path }) => assert_eq!(path, "selfish -> selfish"),
            other => panic!("expected Cycle, got {other:?}"),
        }
    }
}
