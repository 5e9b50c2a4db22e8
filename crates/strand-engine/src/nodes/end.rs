use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use strand_core::error::Result;
use strand_core::route::NodeRunResult;
use strand_core::variables::{Segment, Selector};

use super::{done, NodeRunContext, NodeStrategy, NodeStream, VariableSelectorMapping};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Default, Deserialize)]
struct EndConfig {
    #[serde(default)]
    outputs: Vec<VariableSelectorMapping>,
}

/// Terminal node. Its outputs become the run's final outputs.
pub struct EndNode {
    outputs: Vec<VariableSelectorMapping>,
}

impl EndNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: EndConfig = desc.parse_config()?;
        Ok(Self {
            outputs: config.outputs,
        })
    }
}

impl NodeStrategy for EndNode {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    fn reads(&self) -> Vec<Selector> {
        self.outputs.iter().map(|o| o.value_selector.clone()).collect()
    }

    fn writes(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.variable.clone()).collect()
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        let outputs: BTreeMap<String, Segment> = self
            .outputs
            .iter()
            .map(|o| {
                let value = ctx.pool.get(&o.value_selector).unwrap_or(Segment::None);
                (o.variable.clone(), value)
            })
            .collect();
        let inputs = outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect();
        done(Ok(NodeRunResult {
            inputs,
            outputs,
            ..Default::default()
        }))
    }
}
