use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::route::RuntimeRouteState;
use crate::variables::{Segment, VariablePool};

/// Traversal state of an edge or node within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalState {
    #[default]
    Unknown,
    Taken,
    Skipped,
}

/// Everything needed to continue a paused run in another engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub execution_id: String,
    pub variable_pool: VariablePool,
    pub route_state: RuntimeRouteState,
    /// Keyed by edge id.
    pub edge_states: BTreeMap<String, TraversalState>,
    /// Keyed by node id.
    pub node_states: BTreeMap<String, TraversalState>,
    /// Paused route state ids, in dispatch order.
    pub ready_queue: Vec<String>,
    pub outputs: BTreeMap<String, Segment>,
    pub steps: usize,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub exceptions_count: usize,
}

impl RuntimeSnapshot {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
