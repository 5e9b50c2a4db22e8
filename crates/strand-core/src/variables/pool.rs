use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::segment::{File, Segment};
use super::selector::{Selector, CONVERSATION_SCOPE, ENVIRONMENT_SCOPE, SYSTEM_SCOPE};
use super::template::{self, TemplatePart};
use crate::error::{Result, StrandError};

/// Well-known values stored under the `sys` scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemVariables {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub dialogue_count: Option<i64>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl SystemVariables {
    fn into_segments(self) -> Vec<(&'static str, Segment)> {
        let mut out = vec![("files", Segment::ArrayFile(self.files))];
        let strings = [
            ("query", self.query),
            ("conversation_id", self.conversation_id),
            ("user_id", self.user_id),
            ("workflow_run_id", self.workflow_run_id),
            ("app_id", self.app_id),
            ("workflow_id", self.workflow_id),
        ];
        for (name, value) in strings {
            if let Some(v) = value {
                out.push((name, Segment::String(v)));
            }
        }
        if let Some(count) = self.dialogue_count {
            out.push(("dialogue_count", Segment::Integer(count)));
        }
        out
    }
}

/// Typed variable storage for one execution.
///
/// Keyed by `(node id or scope, variable name)`; deeper selector paths
/// descend into object and file segments at read time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablePool {
    variables: BTreeMap<String, BTreeMap<String, Segment>>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool with system, environment and conversation scopes seeded.
    pub fn with_scopes(
        system: SystemVariables,
        environment: BTreeMap<String, Segment>,
        conversation: BTreeMap<String, Segment>,
    ) -> Self {
        let mut pool = Self::new();
        let sys = pool.variables.entry(SYSTEM_SCOPE.to_string()).or_default();
        for (name, seg) in system.into_segments() {
            sys.insert(name.to_string(), seg);
        }
        if !environment.is_empty() {
            pool.variables
                .insert(ENVIRONMENT_SCOPE.to_string(), environment);
        }
        if !conversation.is_empty() {
            pool.variables
                .insert(CONVERSATION_SCOPE.to_string(), conversation);
        }
        pool
    }

    /// Look up a segment. Paths below the variable descend into objects/files.
    pub fn get(&self, selector: &Selector) -> Option<Segment> {
        let (scope, name) = selector.storage_key();
        let seg = self.variables.get(&scope)?.get(&name)?;
        seg.get_path(selector.nested_path())
    }

    pub fn contains(&self, selector: &Selector) -> bool {
        self.get(selector).is_some()
    }

    /// Upsert a variable. Writes into reserved scopes are rejected.
    pub fn add(&mut self, selector: &Selector, value: impl Into<Segment>) -> Result<()> {
        if selector.is_reserved() {
            return Err(StrandError::ReservedScope(selector.to_string()));
        }
        self.insert(selector, value.into())
    }

    /// Write a conversation variable. Only assignment nodes go through here.
    pub fn assign_conversation(&mut self, name: &str, value: Segment) -> Result<()> {
        self.insert(&Selector::new(CONVERSATION_SCOPE, &[name]), value)
    }

    fn insert(&mut self, selector: &Selector, value: Segment) -> Result<()> {
        if !selector.nested_path().is_empty() {
            return Err(StrandError::InvalidSelector(format!(
                "cannot write nested path {selector}"
            )));
        }
        let (scope, name) = selector.storage_key();
        self.variables.entry(scope).or_default().insert(name, value);
        Ok(())
    }

    /// Write every output of a finished node under its own id.
    pub fn add_node_outputs(
        &mut self,
        node_id: &str,
        outputs: &BTreeMap<String, Segment>,
    ) -> Result<()> {
        for (name, value) in outputs {
            self.add(&Selector::new(node_id, &[name.as_str()]), value.clone())?;
        }
        Ok(())
    }

    /// All variables stored under one node id or scope.
    pub fn scope(&self, node_id: &str) -> Option<&BTreeMap<String, Segment>> {
        self.variables.get(node_id)
    }

    /// Render `{{#node.var#}}` placeholders. Unresolved ones stay literal.
    pub fn convert_template(&self, text: &str) -> String {
        template::parse(text)
            .into_iter()
            .map(|part| match part {
                TemplatePart::Text(t) => t,
                TemplatePart::Variable { selector, raw } => match self.get(&selector) {
                    Some(seg) => seg.text(),
                    None => raw,
                },
            })
            .collect()
    }

    /// Resolve a selector to plain JSON, `Value::Null` when absent.
    pub fn get_value(&self, selector: &Selector) -> Value {
        self.get(selector)
            .map(|s| s.to_value())
            .unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.variables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
