use serde::{Deserialize, Serialize};

/// Handle used by plain (non-branching) edges.
pub const DEFAULT_HANDLE: &str = "source";
/// Handle taken when a node fails under the fail-branch strategy.
pub const FAIL_BRANCH_HANDLE: &str = "fail-branch";

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub source_handle: String,
}

impl Edge {
    /// Generated ids quote each part, so ids containing `-` cannot collide.
    pub fn new(source: &str, target: &str, source_handle: &str) -> Self {
        Self {
            id: format!("{source:?}[{source_handle:?}]->{target:?}"),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: source_handle.to_string(),
        }
    }

    pub fn is_fail_branch(&self) -> bool {
        self.source_handle == FAIL_BRANCH_HANDLE
    }

    /// Whether this edge follows from the handle a node selected.
    ///
    /// `None` is a normal success: every edge except fail-branch ones.
    pub fn matches(&self, selected: Option<&str>) -> bool {
        match selected {
            Some(handle) => self.source_handle == handle,
            None => !self.is_fail_branch(),
        }
    }
}
