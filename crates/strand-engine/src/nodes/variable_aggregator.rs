use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::variables::{Segment, SegmentType, Selector, VariablePool};

use super::{dedup_selectors, done, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorGroup {
    pub group_name: String,
    #[serde(default = "default_output_type")]
    pub output_type: SegmentType,
    #[serde(default)]
    pub variables: Vec<Selector>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AdvancedSettings {
    #[serde(default)]
    group_enabled: bool,
    #[serde(default)]
    groups: Vec<AggregatorGroup>,
}

#[derive(Debug, Clone, Deserialize)]
struct AggregatorConfig {
    #[serde(default = "default_output_type")]
    output_type: SegmentType,
    #[serde(default)]
    variables: Vec<Selector>,
    #[serde(default)]
    advanced_settings: AdvancedSettings,
}

fn default_output_type() -> SegmentType {
    SegmentType::Any
}

/// Picks the first candidate selector that holds a value.
///
/// Typically joins the branches of an if-else: only the taken branch wrote
/// its output, so the first present one wins. In grouped mode each group is
/// resolved independently and written as `<group_name>.output`.
pub struct VariableAggregatorNode {
    node_id: String,
    config: AggregatorConfig,
}

impl VariableAggregatorNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: AggregatorConfig = desc.parse_config()?;
        let settings = &config.advanced_settings;
        if settings.group_enabled && settings.groups.is_empty() {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: "grouping enabled but no groups declared".into(),
            });
        }
        Ok(Self {
            node_id: desc.id.clone(),
            config,
        })
    }

    fn grouped(&self) -> bool {
        self.config.advanced_settings.group_enabled
    }

    fn first_present(
        &self,
        pool: &VariablePool,
        selectors: &[Selector],
        declared: SegmentType,
    ) -> Option<(Selector, Segment)> {
        for sel in selectors {
            match pool.get(sel) {
                Some(seg) if seg.is_none() => continue,
                Some(seg) if declared.accepts(seg.segment_type()) => return Some((sel.clone(), seg)),
                Some(seg) => {
                    tracing::debug!(
                        node_id = %self.node_id,
                        selector = %sel,
                        actual = %seg.segment_type(),
                        "Skipping candidate of wrong type"
                    );
                }
                None => {}
            }
        }
        None
    }
}

impl NodeStrategy for VariableAggregatorNode {
    fn node_type(&self) -> NodeType {
        NodeType::VariableAggregator
    }

    fn reads(&self) -> Vec<Selector> {
        if self.grouped() {
            dedup_selectors(
                self.config
                    .advanced_settings
                    .groups
                    .iter()
                    .flat_map(|g| g.variables.iter().cloned()),
            )
        } else {
            dedup_selectors(self.config.variables.iter().cloned())
        }
    }

    fn writes(&self) -> Vec<String> {
        if self.grouped() {
            self.config
                .advanced_settings
                .groups
                .iter()
                .map(|g| g.group_name.clone())
                .collect()
        } else {
            vec!["output".into()]
        }
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        let mut outputs = BTreeMap::new();
        let mut inputs = Map::new();

        if self.grouped() {
            for group in &self.config.advanced_settings.groups {
                let picked = self.first_present(&ctx.pool, &group.variables, group.output_type);
                let mut obj = Map::new();
                let value = match picked {
                    Some((sel, seg)) => {
                        inputs.insert(group.group_name.clone(), Value::String(sel.to_string()));
                        seg.to_value()
                    }
                    None => Value::Null,
                };
                obj.insert("output".into(), value);
                outputs.insert(group.group_name.clone(), Segment::Object(obj));
            }
        } else {
            let picked =
                self.first_present(&ctx.pool, &self.config.variables, self.config.output_type);
            let seg = match picked {
                Some((sel, seg)) => {
                    inputs.insert("selected".into(), Value::String(sel.to_string()));
                    seg
                }
                None => Segment::None,
            };
            outputs.insert("output".into(), seg);
        }

        done(Ok(NodeRunResult {
            inputs,
            outputs,
            ..Default::default()
        }))
    }
}
