use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, StrandError};
use crate::types::LlmUsage;
use crate::variables::{Segment, Selector};

/// Execution status of one node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Success,
    Failed,
    Paused,
    Exception,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Exception)
    }
}

/// Everything a node run produced, recorded on its route state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRunResult {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub process_data: Map<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Segment>,
    /// Branch handle chosen by if-else / classifier nodes.
    #[serde(default)]
    pub edge_source_handle: Option<String>,
    #[serde(default)]
    pub usage: LlmUsage,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Writes outside the node's own scope (conversation or loop variables).
    #[serde(default)]
    pub variable_updates: Vec<VariableUpdate>,
}

/// A pool write requested by a node for a selector it does not own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub selector: Selector,
    pub value: Segment,
}

impl NodeRunResult {
    pub fn with_outputs(outputs: BTreeMap<String, Segment>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    pub fn output(mut self, name: &str, value: impl Into<Segment>) -> Self {
        self.outputs.insert(name.to_string(), value.into());
        self
    }

    pub fn handle(mut self, handle: impl Into<String>) -> Self {
        self.edge_source_handle = Some(handle.into());
        self
    }
}

/// Per-node execution record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteNodeState {
    pub state_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    pub start_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Dispatch order within the run, starting at 1.
    pub index: usize,
    #[serde(default)]
    pub result: Option<NodeRunResult>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub retries: u32,
}

impl RouteNodeState {
    pub fn elapsed_ms(&self) -> i64 {
        self.finished_at
            .map(|f| (f - self.start_at).num_milliseconds())
            .unwrap_or_default()
    }
}

/// Full execution trace: which node state led to which.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRouteState {
    pub routes: BTreeMap<String, Vec<String>>,
    pub node_state_mapping: BTreeMap<String, RouteNodeState>,
    #[serde(default)]
    next_index: usize,
}

impl RuntimeRouteState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a running state for `node_id`, assigning the next index.
    pub fn create_node_state(&mut self, node_id: &str) -> &RouteNodeState {
        self.create_with_status(node_id, NodeStatus::Running)
    }

    /// Record a node that was ready but not dispatched when the run paused.
    pub fn create_paused_state(&mut self, node_id: &str) -> &RouteNodeState {
        self.create_with_status(node_id, NodeStatus::Paused)
    }

    fn create_with_status(&mut self, node_id: &str, status: NodeStatus) -> &RouteNodeState {
        self.next_index += 1;
        let state = RouteNodeState {
            state_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            status,
            start_at: Utc::now(),
            finished_at: None,
            index: self.next_index,
            result: None,
            failed_reason: None,
            retries: 0,
        };
        let id = state.state_id.clone();
        self.node_state_mapping.entry(id).or_insert(state)
    }

    /// Move a paused state back to running after a resume.
    pub fn resume_state(&mut self, state_id: &str) -> Result<&RouteNodeState> {
        let state = self.state_mut(state_id)?;
        if state.status != NodeStatus::Paused {
            return Err(StrandError::InvalidGraph(format!(
                "route state {state_id} is {:?}, not paused",
                state.status
            )));
        }
        state.status = NodeStatus::Running;
        state.start_at = Utc::now();
        Ok(&*state)
    }

    /// Link a predecessor state to the state it led to.
    pub fn add_route(&mut self, source_state_id: &str, target_state_id: &str) {
        let targets = self.routes.entry(source_state_id.to_string()).or_default();
        if !targets.iter().any(|t| t == target_state_id) {
            targets.push(target_state_id.to_string());
        }
    }

    /// Close a running state. Only `running -> terminal` is legal.
    pub fn finish(
        &mut self,
        state_id: &str,
        status: NodeStatus,
        result: Option<NodeRunResult>,
        failed_reason: Option<String>,
    ) -> Result<&RouteNodeState> {
        let state = self.state_mut(state_id)?;
        if state.status != NodeStatus::Running || !status.is_terminal() {
            return Err(StrandError::InvalidGraph(format!(
                "illegal route transition {:?} -> {:?} for node {}",
                state.status, status, state.node_id
            )));
        }
        state.status = status;
        state.finished_at = Some(Utc::now());
        state.result = result;
        state.failed_reason = failed_reason;
        Ok(&*state)
    }

    pub fn record_retry(&mut self, state_id: &str) -> Result<u32> {
        let state = self.state_mut(state_id)?;
        state.retries += 1;
        Ok(state.retries)
    }

    pub fn get(&self, state_id: &str) -> Option<&RouteNodeState> {
        self.node_state_mapping.get(state_id)
    }

    fn state_mut(&mut self, state_id: &str) -> Result<&mut RouteNodeState> {
        self.node_state_mapping
            .get_mut(state_id)
            .ok_or_else(|| StrandError::NodeNotFound(format!("route state {state_id}")))
    }

    /// Most recent state recorded for a node.
    pub fn latest_for_node(&self, node_id: &str) -> Option<&RouteNodeState> {
        self.node_state_mapping
            .values()
            .filter(|s| s.node_id == node_id)
            .max_by_key(|s| s.index)
    }

    /// All states in dispatch order.
    pub fn ordered(&self) -> Vec<&RouteNodeState> {
        let mut states: Vec<_> = self.node_state_mapping.values().collect();
        states.sort_by_key(|s| s.index);
        states
    }

    pub fn paused_states(&self) -> Vec<&RouteNodeState> {
        self.ordered()
            .into_iter()
            .filter(|s| s.status == NodeStatus::Paused)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.node_state_mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_state_mapping.is_empty()
    }
}
