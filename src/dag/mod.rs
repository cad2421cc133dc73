pub mod compile;
pub mod definition;
pub(crate) mod node_runner;
pub mod runner;

pub use compile::{compile, CompiledGraph, DagError};
pub use definition::{DagConfig, NodeConfig, NodeInput};
pub use node_runner::NodeState;
pub use runner::{run_dag, DagRunner, OUTPUT_NODE};
