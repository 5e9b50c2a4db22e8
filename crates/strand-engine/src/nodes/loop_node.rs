use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use strand_core::command::InMemoryCommandChannel;
use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::variables::{Segment, SegmentType, Selector, VariablePool};

use super::condition::{self, Condition, LogicalOperator};
use super::{
    conversation_updates, from_future, NodeError, NodeResult, NodeRunContext, NodeStrategy,
    NodeStream,
};
use crate::engine::GraphEngine;
use crate::graph::{Graph, NodeDescription, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopValueType {
    #[default]
    Constant,
    Variable,
}

/// A variable carried from one pass to the next.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopVariable {
    pub label: String,
    pub var_type: SegmentType,
    #[serde(default)]
    pub value_type: LoopValueType,
    /// A constant, or a selector when `value_type` is `variable`.
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct LoopConfig {
    loop_count: usize,
    #[serde(default)]
    break_conditions: Vec<Condition>,
    #[serde(default)]
    logical_operator: LogicalOperator,
    #[serde(default)]
    loop_variables: Vec<LoopVariable>,
}

/// Runs the child graph repeatedly until a break condition holds or the
/// pass budget runs out.
///
/// Loop variables live under the loop's own id. Assigner nodes in the body
/// update them; the updated values seed the next pass.
pub struct LoopNode {
    node_id: String,
    config: LoopConfig,
    child: Arc<Graph>,
}

impl LoopNode {
    pub fn new(desc: &NodeDescription, child: Arc<Graph>) -> Result<Self> {
        let config: LoopConfig = desc.parse_config()?;
        for var in &config.loop_variables {
            if var.value_type == LoopValueType::Variable
                && serde_json::from_value::<Selector>(var.value.clone()).is_err()
            {
                return Err(StrandError::NodeConfig {
                    node_id: desc.id.clone(),
                    message: format!("loop variable {} has an invalid selector", var.label),
                });
            }
        }
        Ok(Self {
            node_id: desc.id.clone(),
            config,
            child,
        })
    }

    fn initial_value(&self, var: &LoopVariable, pool: &VariablePool) -> std::result::Result<Segment, NodeError> {
        let raw = match var.value_type {
            LoopValueType::Constant => var.value.clone(),
            LoopValueType::Variable => {
                let selector: Selector = serde_json::from_value(var.value.clone())
                    .map_err(|e| NodeError::recoverable("LoopVariableError", e.to_string()))?;
                pool.get_value(&selector)
            }
        };
        if raw.is_null() {
            return Ok(Segment::None);
        }
        Segment::from_value_typed(raw, var.var_type).ok_or_else(|| {
            NodeError::recoverable(
                "LoopVariableError",
                format!("loop variable {} is not a {}", var.label, var.var_type),
            )
        })
    }

    fn should_break(&self, pool: &VariablePool) -> bool {
        !self.config.break_conditions.is_empty()
            && condition::evaluate_all(pool, &self.config.break_conditions, self.config.logical_operator)
    }

    async fn iterate(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let max_rounds = self.config.loop_count.min(ctx.exec.containers.max_iterations);
        let mut pool: VariablePool = (*ctx.pool).clone();
        let mut variables = BTreeMap::new();
        for var in &self.config.loop_variables {
            let value = self.initial_value(var, &pool)?;
            pool.add(&Selector::new(self.node_id.clone(), &[var.label.as_str()]), value.clone())?;
            variables.insert(var.label.clone(), value);
        }

        let mut rounds = 0;
        while rounds < max_rounds && !self.should_break(&pool) {
            if ctx.exec.is_cancelled() {
                return Err(StrandError::Cancelled.into());
            }
            pool.add(
                &Selector::new(self.node_id.clone(), &["index"]),
                Segment::Integer(rounds as i64),
            )?;
            debug!(node_id = %self.node_id, round = rounds, "Loop pass");

            let engine = GraphEngine::new(
                self.child.clone(),
                pool,
                Arc::new(InMemoryCommandChannel::new()),
                ctx.limits,
                ctx.exec.nested()?,
            );
            let outcome = engine.run_to_end().await;
            if !outcome.succeeded() {
                let message = outcome.error().unwrap_or("child run ended early").to_string();
                return Err(NodeError::recoverable(
                    "LoopError",
                    format!("loop round {rounds} failed: {message}"),
                ));
            }
            pool = outcome.pool;
            rounds += 1;
        }
        info!(node_id = %self.node_id, rounds, "Loop finished");

        let mut result = NodeRunResult::default();
        result.variable_updates = conversation_updates(&ctx.pool, &pool);
        for label in variables.keys() {
            let value = pool
                .get(&Selector::new(self.node_id.clone(), &[label.as_str()]))
                .unwrap_or(Segment::None);
            result = result.output(label, value);
        }
        Ok(result.output("loop_round", Segment::Integer(rounds as i64)))
    }
}

impl NodeStrategy for LoopNode {
    fn node_type(&self) -> NodeType {
        NodeType::Loop
    }

    fn reads(&self) -> Vec<Selector> {
        let mut reads: Vec<Selector> = self
            .config
            .loop_variables
            .iter()
            .filter(|v| v.value_type == LoopValueType::Variable)
            .filter_map(|v| serde_json::from_value(v.value.clone()).ok())
            .collect();
        // break conditions on the loop's own variables are satisfied internally
        reads.extend(
            condition::selectors(&self.config.break_conditions)
                .into_iter()
                .filter(|s| s.node_id != self.node_id),
        );
        reads
    }

    fn writes(&self) -> Vec<String> {
        let mut writes: Vec<String> = self
            .config
            .loop_variables
            .iter()
            .map(|v| v.label.clone())
            .collect();
        writes.push("loop_round".into());
        writes
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.iterate(ctx))
    }

    fn child_graph(&self) -> Option<&Arc<Graph>> {
        Some(&self.child)
    }

    fn first_pass_scope(&self, pool: &VariablePool) -> Result<Vec<(Selector, Segment)>> {
        let mut scope = vec![(Selector::new(self.node_id.clone(), &["index"]), Segment::Integer(0))];
        for var in &self.config.loop_variables {
            let value = self.initial_value(var, pool).map_err(|e| StrandError::NodeConfig {
                node_id: self.node_id.clone(),
                message: e.message,
            })?;
            scope.push((Selector::new(self.node_id.clone(), &[var.label.as_str()]), value));
        }
        Ok(scope)
    }
}
