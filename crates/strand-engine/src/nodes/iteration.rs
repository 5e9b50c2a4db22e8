use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use strand_core::command::InMemoryCommandChannel;
use strand_core::config::EngineLimits;
use strand_core::context::ExecutionContext;
use strand_core::error::Result;
use strand_core::route::{NodeRunResult, VariableUpdate};
use strand_core::variables::{Segment, Selector, VariablePool};

use super::{
    conversation_updates, from_future, NodeError, NodeResult, NodeRunContext, NodeStrategy,
    NodeStream,
};
use crate::engine::GraphEngine;
use crate::graph::{Graph, NodeDescription, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandleMode {
    #[default]
    Terminated,
    ContinueOnError,
    RemoveAbnormalOutput,
}

#[derive(Debug, Clone, Deserialize)]
struct IterationConfig {
    iterator_selector: Selector,
    output_selector: Selector,
    #[serde(default)]
    is_parallel: bool,
    #[serde(default = "default_parallel_nums")]
    parallel_nums: usize,
    #[serde(default)]
    error_handle_mode: ErrorHandleMode,
}

fn default_parallel_nums() -> usize {
    10
}

/// One pass: the value at `output_selector` and the conversation writes.
type PassResult = std::result::Result<(Segment, Vec<VariableUpdate>), NodeError>;

/// Runs the child graph once per item of an array variable.
///
/// Each pass gets a copy of the parent pool with `item` and `index` seeded
/// under the iteration's id, and contributes whatever the child wrote at
/// `output_selector` to the `output` array.
pub struct IterationNode {
    node_id: String,
    config: IterationConfig,
    child: Arc<Graph>,
}

impl IterationNode {
    pub fn new(desc: &NodeDescription, child: Arc<Graph>) -> Result<Self> {
        Ok(Self {
            node_id: desc.id.clone(),
            config: desc.parse_config()?,
            child,
        })
    }

    fn items(&self, pool: &VariablePool) -> std::result::Result<Vec<Segment>, NodeError> {
        match pool.get(&self.config.iterator_selector) {
            Some(seg) => seg.items().ok_or_else(|| {
                NodeError::recoverable(
                    "IteratorVariableError",
                    format!("{} is not an array", self.config.iterator_selector),
                )
            }),
            None => Err(NodeError::recoverable(
                "IteratorVariableError",
                format!("{} not found", self.config.iterator_selector),
            )),
        }
    }

    async fn iterate(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let items = self.items(&ctx.pool)?;
        if items.is_empty() {
            return Ok(NodeRunResult::default().output("output", Segment::ArrayAny(vec![])));
        }

        let width = if self.config.is_parallel {
            self.config
                .parallel_nums
                .clamp(1, ctx.exec.containers.max_parallel_iterations.max(1))
        } else {
            1
        };
        debug!(node_id = %self.node_id, items = items.len(), width, "Starting iteration");

        let total = items.len();
        let mut passes = futures::stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| self.clone().run_pass(&ctx, index, item))
            .buffered(width);

        let mut outputs = Vec::with_capacity(total);
        let mut updates = Vec::new();
        while let Some((index, result)) = passes.next().await {
            match result {
                Ok((value, pass_updates)) => {
                    outputs.push(value);
                    updates.extend(pass_updates);
                }
                Err(e) => match self.config.error_handle_mode {
                    ErrorHandleMode::Terminated => {
                        return Err(NodeError::recoverable(
                            "IterationError",
                            format!("iteration {index} failed: {}", e.message),
                        ))
                    }
                    ErrorHandleMode::ContinueOnError => {
                        warn!(node_id = %self.node_id, index, error = %e, "Iteration failed, continuing");
                        outputs.push(Segment::None);
                    }
                    ErrorHandleMode::RemoveAbnormalOutput => {
                        warn!(node_id = %self.node_id, index, error = %e, "Dropping failed iteration");
                    }
                },
            }
        }

        let mut result = NodeRunResult::default()
            .output("output", Segment::from_items(outputs))
            .output("iterations", Segment::Integer(total as i64));
        result.variable_updates = updates;
        Ok(result)
    }

    fn run_pass(
        self: Arc<Self>,
        ctx: &NodeRunContext,
        index: usize,
        item: Segment,
    ) -> BoxFuture<'static, (usize, PassResult)> {
        let pool: VariablePool = (*ctx.pool).clone();
        let exec = ctx.exec.nested();
        let limits = ctx.limits;
        Box::pin(async move {
            let result = match exec {
                Ok(exec) => self.pass(pool, exec, limits, index, item).await,
                Err(e) => Err(e.into()),
            };
            (index, result)
        })
    }

    async fn pass(
        &self,
        mut pool: VariablePool,
        exec: ExecutionContext,
        limits: EngineLimits,
        index: usize,
        item: Segment,
    ) -> PassResult {
        let before = pool.clone();
        pool.add(&Selector::new(self.node_id.clone(), &["item"]), item)?;
        pool.add(
            &Selector::new(self.node_id.clone(), &["index"]),
            Segment::Integer(index as i64),
        )?;
        let engine = GraphEngine::new(
            self.child.clone(),
            pool,
            Arc::new(InMemoryCommandChannel::new()),
            limits,
            exec,
        );
        let outcome = engine.run_to_end().await;
        if !outcome.succeeded() {
            let message = outcome.error().unwrap_or("child run ended early").to_string();
            return Err(NodeError::recoverable("IterationError", message));
        }
        let value = outcome
            .pool
            .get(&self.config.output_selector)
            .unwrap_or(Segment::None);
        Ok((value, conversation_updates(&before, &outcome.pool)))
    }
}

impl NodeStrategy for IterationNode {
    fn node_type(&self) -> NodeType {
        NodeType::Iteration
    }

    fn reads(&self) -> Vec<Selector> {
        vec![self.config.iterator_selector.clone()]
    }

    fn writes(&self) -> Vec<String> {
        vec!["output".into(), "iterations".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.iterate(ctx))
    }

    fn child_graph(&self) -> Option<&Arc<Graph>> {
        Some(&self.child)
    }

    fn first_pass_scope(&self, pool: &VariablePool) -> Result<Vec<(Selector, Segment)>> {
        let item = self
            .items(pool)
            .ok()
            .and_then(|items| items.into_iter().next())
            .unwrap_or(Segment::None);
        Ok(vec![
            (Selector::new(self.node_id.clone(), &["item"]), item),
            (Selector::new(self.node_id.clone(), &["index"]), Segment::Integer(0)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::context::Services;
    use strand_test_utils::fixtures::*;
    use strand_test_utils::services::FakeCodeExecutor;

    use crate::graph::GraphDescription;
    use crate::nodes::testing::{collect, ctx};
    use crate::nodes::StrategyRegistry;

    fn iteration_graph(mode: &str) -> Arc<Graph> {
        let mut it = node(
            "it",
            "iteration",
            json!({
                "iterator_selector": ["start", "items"],
                "output_selector": ["double", "y"],
                "start_node_id": "double",
                "error_handle_mode": mode,
            }),
        );
        it["config"]["is_parallel"] = json!(true);
        let mut double = code_node("double", &[("x", &["it", "item"])], &[("y", "number")]);
        double["container_id"] = json!("it");
        let desc = GraphDescription::from_value(workflow(
            vec![start_node(&["items"]), it, double],
            vec![edge("start", "it")],
        ))
        .unwrap();
        Graph::build(&desc, &StrategyRegistry::default()).unwrap()
    }

    fn doubling() -> Arc<FakeCodeExecutor> {
        Arc::new(FakeCodeExecutor::new(|inputs| {
            match inputs.get("x").and_then(serde_json::Value::as_i64) {
                Some(3) => Err(strand_core::error::StrandError::CodeExecution("three".into())),
                Some(x) => Ok(json!({"y": x * 2}).as_object().cloned().unwrap_or_default()),
                None => Ok(serde_json::Map::new()),
            }
        }))
    }

    async fn run(graph: &Graph, items: serde_json::Value) -> NodeResult {
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["items"]), Segment::from_value(items))
            .unwrap();
        let node = graph.node("it").unwrap().strategy.clone();
        let services = Services::new().with_code(doubling());
        let (_, result) = collect(node.run(ctx("it", pool, services))).await;
        result
    }

    #[tokio::test]
    async fn test_collects_outputs_in_item_order() {
        let graph = iteration_graph("terminated");
        let result = run(&graph, json!([1, 2, 4])).await.unwrap();
        assert_eq!(
            result.outputs["output"].to_value(),
            json!([2, 4, 8])
        );
    }

    #[tokio::test]
    async fn test_terminated_mode_fails_node() {
        let graph = iteration_graph("terminated");
        let err = run(&graph, json!([1, 3])).await.unwrap_err();
        assert_eq!(err.error_type, "IterationError");
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_null() {
        let graph = iteration_graph("continue-on-error");
        let result = run(&graph, json!([1, 3, 5])).await.unwrap();
        assert_eq!(result.outputs["output"].to_value(), json!([2, null, 10]));
    }

    #[tokio::test]
    async fn test_remove_abnormal_output_drops_failures() {
        let graph = iteration_graph("remove-abnormal-output");
        let result = run(&graph, json!([1, 3, 5])).await.unwrap();
        assert_eq!(result.outputs["output"].to_value(), json!([2, 10]));
    }

    #[tokio::test]
    async fn test_non_array_iterator_is_rejected() {
        let graph = iteration_graph("terminated");
        let err = run(&graph, json!("nope")).await.unwrap_err();
        assert_eq!(err.error_type, "IteratorVariableError");
    }

    fn remembering_graph() -> Arc<Graph> {
        let it = node(
            "it",
            "iteration",
            json!({
                "iterator_selector": ["start", "items"],
                "output_selector": ["it", "item"],
                "start_node_id": "remember",
            }),
        );
        let mut remember = node(
            "remember",
            "assigner",
            json!({
                "assigned_variable_selector": ["conversation", "last"],
                "input_variable_selector": ["it", "item"],
                "write_mode": "over-write",
            }),
        );
        remember["container_id"] = json!("it");
        let desc = GraphDescription::from_value(workflow(
            vec![start_node(&["items"]), it, remember],
            vec![edge("start", "it")],
        ))
        .unwrap();
        Graph::build(&desc, &StrategyRegistry::default()).unwrap()
    }

    #[tokio::test]
    async fn test_conversation_writes_reach_parent() {
        let result = run(&remembering_graph(), json!(["a", "b"])).await.unwrap();
        let written: Vec<_> = result
            .variable_updates
            .iter()
            .map(|u| (u.selector.to_string(), u.value.clone()))
            .collect();
        assert_eq!(
            written,
            vec![
                ("conversation.last".to_string(), Segment::from("a")),
                ("conversation.last".to_string(), Segment::from("b")),
            ]
        );
    }

    #[test]
    fn test_first_pass_scope_uses_first_item() {
        let graph = iteration_graph("terminated");
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["items"]), Segment::from_value(json!([7, 8])))
            .unwrap();
        let scope = graph.node("it").unwrap().strategy.first_pass_scope(&pool).unwrap();
        assert_eq!(
            scope,
            vec![
                (Selector::new("it", &["item"]), Segment::Integer(7)),
                (Selector::new("it", &["index"]), Segment::Integer(0)),
            ]
        );
    }
}
