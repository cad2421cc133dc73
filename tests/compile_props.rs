//! Property tests for DAG compilation.

use proptest::prelude::*;
use serde_json::{json, Value};
use trellis::dag::{DagConfig, DagError, DagRunner, NodeConfig, NodeInput};

fn node_name(index: usize) -> String {
    format!("n{index}")
}

/// Build a DAG where node `i` may only depend on nodes `j < i`, which
/// makes the graph acyclic by construction.
fn forward_dag(adjacency: &[Vec<bool>]) -> DagConfig<()> {
    let mut dag = DagConfig::new("generated", || ());
    for (index, row) in adjacency.iter().enumerate() {
        let parents: Vec<String> = row
            .iter()
            .take(index)
            .enumerate()
            .filter(|(_, flag)| **flag)
            .map(|(parent, _)| node_name(parent))
            .collect();
        dag = dag.add_node(
            node_name(index),
            NodeConfig::new(|_input: NodeInput<()>| async move { Ok(Value::Null) })
                .with_parents(parents),
        );
    }
    dag
}

proptest! {
    /// Forward-referencing graphs always compile; the computed root set
    /// is exactly the parentless nodes and the leaf set is exactly the
    /// unreferenced ones.
    #[test]
    fn prop_forward_graphs_compile(
        adjacency in proptest::collection::vec(
            proptest::collection::vec(any::<bool>(), 8),
            1..8,
        )
    ) {
        let n = adjacency.len();
        let runner = DagRunner::new(forward_dag(&adjacency), json!(null)).unwrap();

        let mut expected_roots: Vec<String> = (0..n)
            .filter(|i| !adjacency[*i].iter().take(*i).any(|flag| *flag))
            .map(node_name)
            .collect();
        expected_roots.sort_unstable();
        prop_assert_eq!(runner.roots(), expected_roots.as_slice());

        let mut expected_leaves: Vec<String> = (0..n)
            .filter(|j| !(j + 1..n).any(|i| adjacency[i][*j]))
            .map(node_name)
            .collect();
        expected_leaves.sort_unstable();
        prop_assert_eq!(runner.leaves(), expected_leaves.as_slice());
    }

    /// Closing a forward chain back onto its head is always a cycle.
    #[test]
    fn prop_closed_chains_are_cycles(n in 2usize..10) {
        let mut dag = DagConfig::new("ring", || ());
        for index in 0..n {
            let parent = if index == 0 { n - 1 } else { index - 1 };
            dag = dag.add_node(
                node_name(index),
                NodeConfig::new(|_input: NodeInput<()>| async move { Ok(Value::Null) })
                    .with_parent(node_name(parent)),
            );
        }
        match DagRunner::new(dag, json!(null)) {
            Err(DagError::Cycle { path }) => {
                let hops: Vec<&str> = path.split(" -> ").collect();
                prop_assert_eq!(hops.len(), n + 1);
                prop_assert_eq!(hops.first(), hops.last());
            }
            other => prop_assert!(false, "expected a cycle error, got {:?}", other.err()),
        }
    }
}
