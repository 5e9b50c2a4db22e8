use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use strand_core::error::{Result, StrandError};
use strand_core::route::{NodeRunResult, VariableUpdate};
use strand_core::variables::{Segment, Selector, ENVIRONMENT_SCOPE, SYSTEM_SCOPE};

use super::{done, NodeError, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    #[default]
    #[serde(alias = "over_write", alias = "overwrite")]
    OverWrite,
    Append,
    Clear,
}

#[derive(Debug, Clone, Deserialize)]
struct AssignerConfig {
    assigned_variable_selector: Selector,
    #[serde(default)]
    input_variable_selector: Option<Selector>,
    #[serde(default)]
    write_mode: WriteMode,
}

/// Writes a conversation (or enclosing loop) variable.
///
/// The write is not applied here: it is returned as a variable update and
/// the engine applies it when the node commits.
pub struct AssignerNode {
    config: AssignerConfig,
}

impl AssignerNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: AssignerConfig = desc.parse_config()?;
        let target = &config.assigned_variable_selector;
        if target.node_id == SYSTEM_SCOPE || target.node_id == ENVIRONMENT_SCOPE {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: format!("{target} is read-only"),
            });
        }
        if config.write_mode != WriteMode::Clear && config.input_variable_selector.is_none() {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: "input_variable_selector is required unless clearing".into(),
            });
        }
        Ok(Self { config })
    }

    fn new_value(&self, current: Segment, input: Segment) -> std::result::Result<Segment, NodeError> {
        match self.config.write_mode {
            WriteMode::OverWrite => Ok(input),
            WriteMode::Clear => Ok(cleared(&current)),
            WriteMode::Append => {
                let mut items = match current {
                    Segment::None => vec![],
                    other => other.items().ok_or_else(|| {
                        NodeError::recoverable(
                            "TypeMismatchError",
                            format!(
                                "cannot append to {} of type {}",
                                self.config.assigned_variable_selector,
                                other.segment_type()
                            ),
                        )
                    })?,
                };
                match input.items() {
                    Some(more) => items.extend(more),
                    None => items.push(input),
                }
                Ok(Segment::from_items(items))
            }
        }
    }
}

/// Empty value of the same shape.
fn cleared(current: &Segment) -> Segment {
    match current {
        Segment::String(_) => Segment::String(String::new()),
        Segment::Integer(_) => Segment::Integer(0),
        Segment::Float(_) => Segment::Float(0.0),
        Segment::Boolean(_) => Segment::Boolean(false),
        Segment::Object(_) => Segment::Object(Map::new()),
        Segment::ArrayString(_) => Segment::ArrayString(vec![]),
        Segment::ArrayNumber(_) => Segment::ArrayNumber(vec![]),
        Segment::ArrayBoolean(_) => Segment::ArrayBoolean(vec![]),
        Segment::ArrayObject(_) => Segment::ArrayObject(vec![]),
        Segment::ArrayFile(_) => Segment::ArrayFile(vec![]),
        _ => Segment::None,
    }
}

impl NodeStrategy for AssignerNode {
    fn node_type(&self) -> NodeType {
        NodeType::Assigner
    }

    fn reads(&self) -> Vec<Selector> {
        let mut sels = vec![self.config.assigned_variable_selector.clone()];
        sels.extend(self.config.input_variable_selector.clone());
        sels
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        let target = &self.config.assigned_variable_selector;
        let current = ctx.pool.get(target).unwrap_or(Segment::None);
        let input = match &self.config.input_variable_selector {
            Some(sel) => match ctx.pool.get(sel) {
                Some(seg) => seg,
                None => {
                    return done(Err(NodeError::recoverable(
                        "VariableNotFoundError",
                        format!("input variable {sel} not found"),
                    )))
                }
            },
            None => Segment::None,
        };

        let value = match self.new_value(current.clone(), input.clone()) {
            Ok(v) => v,
            Err(e) => return done(Err(e)),
        };

        let mut result = NodeRunResult::default();
        result.inputs.insert("value".into(), input.to_value());
        result.process_data.insert(
            "assignment".into(),
            json!({
                "selector": target,
                "write_mode": format!("{:?}", self.config.write_mode),
                "before": current.to_value(),
                "after": value.to_value(),
            }),
        );
        result.variable_updates.push(VariableUpdate {
            selector: target.clone(),
            value,
        });
        done(Ok(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use std::collections::BTreeMap;
    use strand_core::variables::{SystemVariables, VariablePool};

    fn pool() -> VariablePool {
        let mut conversation = BTreeMap::new();
        conversation.insert("history".to_string(), Segment::ArrayString(vec!["a".into()]));
        conversation.insert("name".to_string(), Segment::from("old"));
        let mut pool =
            VariablePool::with_scopes(SystemVariables::default(), BTreeMap::new(), conversation);
        pool.add(&Selector::new("llm", &["text"]), "b").unwrap();
        pool
    }

    fn node(target: &[&str], mode: &str) -> Arc<AssignerNode> {
        let desc = NodeDescription::new(
            "assign",
            "assigner",
            serde_json::json!({
                "assigned_variable_selector": target,
                "input_variable_selector": ["llm", "text"],
                "write_mode": mode,
            }),
        );
        Arc::new(AssignerNode::new(&desc).unwrap())
    }

    async fn update(node: Arc<AssignerNode>) -> VariableUpdate {
        let (_, result) = collect(node.run(ctx("assign", pool(), Default::default()))).await;
        result.unwrap().variable_updates.remove(0)
    }

    #[tokio::test]
    async fn test_overwrite() {
        let u = update(node(&["conversation", "name"], "over-write")).await;
        assert_eq!(u.selector, Selector::new("conversation", &["name"]));
        assert_eq!(u.value, Segment::from("b"));
    }

    #[tokio::test]
    async fn test_append_to_array() {
        let u = update(node(&["conversation", "history"], "append")).await;
        assert_eq!(u.value, Segment::ArrayString(vec!["a".into(), "b".into()]));
    }

    #[tokio::test]
    async fn test_append_to_scalar_fails() {
        let n = node(&["conversation", "name"], "append");
        let (_, result) = collect(n.run(ctx("assign", pool(), Default::default()))).await;
        assert_eq!(result.unwrap_err().error_type, "TypeMismatchError");
    }

    #[tokio::test]
    async fn test_clear_keeps_shape() {
        let u = update(node(&["conversation", "history"], "clear")).await;
        assert_eq!(u.value, Segment::ArrayString(vec![]));
    }

    #[test]
    fn test_system_scope_is_read_only() {
        let desc = NodeDescription::new(
            "assign",
            "assigner",
            serde_json::json!({
                "assigned_variable_selector": ["sys", "query"],
                "input_variable_selector": ["llm", "text"],
            }),
        );
        assert!(AssignerNode::new(&desc).is_err());
    }
}
