//! Graph model: the validated DAG a run executes.
//!
//! A [`GraphDescription`] (plain serde data from the workflow store) is turned
//! into a [`Graph`] once per execution. Building checks ids, edges, the single
//! start node, acyclicity and reachability, splits container children into
//! their own sub-graphs, and resolves each node's strategy through the
//! registry so no lookup happens at dispatch time.

pub mod description;
pub mod edge;
pub mod model;
pub mod node;

pub use description::{
    EdgeDescription, ErrorStrategy, GraphDescription, NodeDescription, RetryConfig,
};
pub use edge::{Edge, DEFAULT_HANDLE, FAIL_BRANCH_HANDLE};
pub use model::Graph;
pub use node::{GraphNode, NodeType};
