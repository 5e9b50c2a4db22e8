use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use strand_core::command::{Command, CommandChannel};
use strand_core::config::EngineLimits;
use strand_core::context::ExecutionContext;
use strand_core::error::{Result, StrandError};
use strand_core::event::{GraphEvent, RunFailureKind};
use strand_core::route::{NodeRunResult, NodeStatus, RuntimeRouteState};
use strand_core::variables::{Segment, Selector, VariablePool};

use super::worker::{self, WorkerEvent};
use super::scheduler::STOPPED_BY_USER;
use super::RunGuard;
use crate::graph::{Edge, ErrorStrategy, Graph, GraphNode, NodeDescription, NodeType, DEFAULT_HANDLE};
use crate::layers::{Layer, LayerSet};
use crate::nodes::start::StartNode;
use crate::nodes::{NodeError, NodeRunContext};

const DEBUG_START_ID: &str = "__debug_start";

/// Debug run of one node in isolation.
///
/// The target is lifted out of its workflow into a `start -> target` graph.
/// Nodes inside an iteration or loop can be targeted too; the enclosing
/// containers' first-pass variables (`item`, `index`, loop variables) are
/// seeded unless the caller supplies them. The pool is seeded from caller
/// inputs keyed by dotted selector (`"llm.text"`), and any selector the node
/// reads that is still missing is filled with an empty value so the node can
/// run without its upstream.
pub struct SingleNodeRun {
    execution_id: String,
    graph: Arc<Graph>,
    target: GraphNode,
    pool: VariablePool,
    channel: Arc<dyn CommandChannel>,
    limits: EngineLimits,
    ctx: ExecutionContext,
    layers: LayerSet,
}

impl SingleNodeRun {
    pub fn new(
        workflow: &Graph,
        node_id: &str,
        mut pool: VariablePool,
        inputs: &Map<String, Value>,
        channel: Arc<dyn CommandChannel>,
        limits: EngineLimits,
        ctx: ExecutionContext,
    ) -> Result<Self> {
        let (containers, target) = workflow
            .find_nested(node_id)
            .ok_or_else(|| StrandError::NodeNotFound(node_id.to_string()))?;
        if target.node_type == NodeType::Start {
            return Err(StrandError::InvalidGraph(
                "the start node cannot be run on its own".into(),
            ));
        }

        for (key, value) in inputs {
            let selector = Selector::parse_dotted(key)?;
            pool.add(&selector, Segment::from_value(value.clone()))?;
        }
        for container in containers {
            for (selector, value) in container.strategy.first_pass_scope(&pool)? {
                if !pool.contains(&selector) {
                    debug!(container = %container.id, selector = %selector, "Seeding container variable");
                    pool.add(&selector, value)?;
                }
            }
        }
        for selector in target.strategy.reads() {
            if selector.is_reserved() {
                continue;
            }
            let variable = Selector::new(selector.node_id.clone(), &[selector.variable()]);
            if !pool.contains(&variable) {
                debug!(selector = %variable, "Filling missing debug input");
                pool.add(&variable, Segment::None)?;
            }
        }

        let target = target.clone();
        let start_desc = NodeDescription::new(DEBUG_START_ID, NodeType::Start.as_str(), json!({}));
        let start = GraphNode::new(&start_desc, NodeType::Start, Arc::new(StartNode::new(&start_desc)?));
        let edge = Edge::new(DEBUG_START_ID, &target.id, DEFAULT_HANDLE);
        let graph = Graph::from_parts(
            DEBUG_START_ID.to_string(),
            vec![start, target.clone()],
            vec![edge],
        )?;

        Ok(Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            graph: Arc::new(graph),
            target,
            pool,
            channel,
            limits,
            ctx,
            layers: LayerSet::default(),
        })
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn with_layer(mut self, layer: Arc<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn run(self) -> BoxStream<'static, GraphEvent> {
        let Self {
            execution_id,
            graph,
            target,
            pool,
            channel,
            limits,
            mut ctx,
            layers,
        } = self;
        ctx.cancel = ctx.cancel.child_token();

        Box::pin(stream! {
            let mut guard = RunGuard::new(ctx.cancel.clone(), layers, execution_id.clone());
            guard.start(&graph);
            let mut route = RuntimeRouteState::new();
            let state = route.create_node_state(&target.id);
            let (state_id, index) = (state.state_id.clone(), state.index);
            info!(execution_id = %execution_id, node_id = %target.id, "Single-node run");

            let opening = [
                GraphEvent::RunStarted { execution_id: execution_id.clone() },
                GraphEvent::NodeStarted {
                    node_id: target.id.clone(),
                    node_type: target.node_type.to_string(),
                    state_id: state_id.clone(),
                    index,
                    predecessor_node_id: Some(DEBUG_START_ID.to_string()),
                },
            ];
            for event in opening {
                guard.observe(&event);
                yield event;
            }

            let (tx, mut rx) = mpsc::channel(16);
            let node_ctx = NodeRunContext {
                node_id: target.id.clone(),
                pool: Arc::new(pool),
                exec: ctx.clone(),
                limits,
            };
            worker::spawn(index, target.clone(), node_ctx, tx);

            let poll_interval = limits.command_poll_interval.max(Duration::from_millis(1));
            let mut result = None;
            let mut stopped = None;
            loop {
                match channel.poll().await {
                    Ok(Some(Command::Stop { reason })) => {
                        stopped = Some(reason.unwrap_or_else(|| STOPPED_BY_USER.to_string()));
                        break;
                    }
                    Ok(Some(Command::Pause { .. })) => {
                        debug!(execution_id = %execution_id, "Pause has no effect on a single-node run");
                    }
                    Ok(None) => {}
                    Err(e) => warn!(execution_id = %execution_id, error = %e, "Command poll failed"),
                }
                let msg = match tokio::time::timeout(poll_interval, rx.recv()).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => continue,
                };
                let event = match msg.event {
                    WorkerEvent::Chunk { selector, text } => GraphEvent::StreamChunk {
                        node_id: target.id.clone(),
                        state_id: state_id.clone(),
                        selector,
                        chunk: text,
                    },
                    WorkerEvent::Log(log) => GraphEvent::AgentLog {
                        node_id: target.id.clone(),
                        state_id: state_id.clone(),
                        log,
                    },
                    WorkerEvent::Retry { attempt, error } => {
                        if let Err(e) = route.record_retry(&state_id) {
                            warn!(error = %e, "Failed to record retry");
                        }
                        GraphEvent::NodeRetry {
                            node_id: target.id.clone(),
                            state_id: state_id.clone(),
                            attempt,
                            error,
                        }
                    }
                    WorkerEvent::Finished(r) => {
                        result = Some(r);
                        break;
                    }
                };
                guard.observe(&event);
                yield event;
            }

            let closing = match stopped {
                Some(reason) => {
                    ctx.cancel.cancel();
                    info!(execution_id = %execution_id, node_id = %target.id, "Single-node run stopped");
                    if let Err(e) = route.finish(&state_id, NodeStatus::Failed, None, Some(reason.clone())) {
                        warn!(error = %e, "Failed to close route state");
                    }
                    vec![GraphEvent::RunStopped { reason }]
                }
                None => {
                    let result = result.unwrap_or_else(|| {
                        Err(NodeError::fatal("InternalError", "node worker exited without a result"))
                    });
                    finish(&target, &state_id, index, &mut route, result)
                }
            };
            for event in closing {
                guard.observe(&event);
                yield event;
            }
            guard.end();
        })
    }
}

/// Close the target's state and build the closing events.
fn finish(
    target: &GraphNode,
    state_id: &str,
    index: usize,
    route: &mut RuntimeRouteState,
    result: std::result::Result<NodeRunResult, NodeError>,
) -> Vec<GraphEvent> {
    let node_type = target.node_type.to_string();
    match result {
        Ok(result) => {
            let outputs = result.outputs.clone();
            let branch = result.edge_source_handle.clone();
            let elapsed_ms = match route.finish(state_id, NodeStatus::Success, Some(result), None) {
                Ok(state) => state.elapsed_ms(),
                Err(e) => {
                    warn!(error = %e, "Failed to close route state");
                    0
                }
            };
            vec![
                GraphEvent::NodeSucceeded {
                    node_id: target.id.clone(),
                    node_type,
                    state_id: state_id.to_string(),
                    index,
                    outputs: outputs.clone(),
                    branch,
                    elapsed_ms,
                },
                GraphEvent::RunSucceeded {
                    outputs,
                    short_circuit: None,
                },
            ]
        }
        Err(e) if !e.is_fatal() && target.error_strategy == Some(ErrorStrategy::DefaultValue) => {
            let mut outputs: BTreeMap<String, Segment> = target.default_value.clone();
            outputs.insert("error_message".into(), Segment::String(e.message.clone()));
            outputs.insert("error_type".into(), Segment::String(e.error_type.clone()));
            if let Err(err) = route.finish(
                state_id,
                NodeStatus::Exception,
                Some(NodeRunResult::with_outputs(outputs.clone())),
                Some(e.message.clone()),
            ) {
                warn!(error = %err, "Failed to close route state");
            }
            vec![
                GraphEvent::NodeException {
                    node_id: target.id.clone(),
                    node_type,
                    state_id: state_id.to_string(),
                    index,
                    error: e.to_string(),
                    outputs: outputs.clone(),
                },
                GraphEvent::RunSucceeded {
                    outputs,
                    short_circuit: None,
                },
            ]
        }
        Err(e) => {
            if let Err(err) = route.finish(state_id, NodeStatus::Failed, None, Some(e.message.clone())) {
                warn!(error = %err, "Failed to close route state");
            }
            let kind = if e.is_fatal() {
                RunFailureKind::FatalException
            } else {
                RunFailureKind::NodeFailure
            };
            vec![
                GraphEvent::NodeFailed {
                    node_id: target.id.clone(),
                    node_type,
                    state_id: state_id.to_string(),
                    index,
                    error: e.to_string(),
                    error_type: e.error_type.clone(),
                },
                GraphEvent::RunFailed {
                    kind,
                    error: e.to_string(),
                    exceptions_count: 0,
                },
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use strand_core::context::Services;
    use strand_test_utils::fixtures::*;
    use strand_core::command::InMemoryCommandChannel;
    use strand_test_utils::llm::ScriptedLlm;
    use strand_test_utils::services::FakeCodeExecutor;

    use crate::graph::GraphDescription;
    use crate::nodes::StrategyRegistry;

    fn workflow_graph() -> Arc<Graph> {
        let desc = GraphDescription::from_value(workflow(
            vec![
                start_node(&["x"]),
                code_node("double", &[("x", &["start", "x"])], &[("y", "number")]),
                end_node("end", &[("y", &["double", "y"])]),
            ],
            vec![edge("start", "double"), edge("double", "end")],
        ))
        .unwrap();
        Graph::build(&desc, &StrategyRegistry::default()).unwrap()
    }

    fn channel() -> Arc<dyn CommandChannel> {
        Arc::new(InMemoryCommandChannel::new())
    }

    fn doubling() -> Arc<FakeCodeExecutor> {
        Arc::new(FakeCodeExecutor::new(|inputs| {
            let x = inputs.get("x").and_then(Value::as_i64).unwrap_or_default();
            Ok(json!({"y": x * 2}).as_object().cloned().unwrap_or_default())
        }))
    }

    fn ctx(code: Arc<FakeCodeExecutor>) -> ExecutionContext {
        ExecutionContext {
            services: Services::new().with_code(code),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_runs_only_the_target() {
        let graph = workflow_graph();
        let code = doubling();
        let inputs = json!({"start.x": 42}).as_object().cloned().unwrap();
        let run = SingleNodeRun::new(
            &graph,
            "double",
            VariablePool::new(),
            &inputs,
            channel(),
            EngineLimits::default(),
            ctx(code),
        )
        .unwrap();

        let events: Vec<GraphEvent> = run.run().collect().await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["run-started", "node-started", "node-succeeded", "run-succeeded"]
        );
        assert_eq!(events[1].node_id(), Some("double"));
        match events.last().unwrap() {
            GraphEvent::RunSucceeded { outputs, .. } => {
                assert_eq!(outputs.get("y"), Some(&Segment::Integer(84)));
            }
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[test]
    fn test_missing_inputs_are_filled() {
        let graph = workflow_graph();
        let code = Arc::new(FakeCodeExecutor::new(|_| Ok(Map::new())));
        let run = SingleNodeRun::new(
            &graph,
            "double",
            VariablePool::new(),
            &Map::new(),
            channel(),
            EngineLimits::default(),
            ctx(code),
        )
        .unwrap();
        assert!(run.pool.contains(&Selector::new("start", &["x"])));
    }

    #[tokio::test]
    async fn test_failure_reports_node_failure() {
        let graph = workflow_graph();
        let code = Arc::new(FakeCodeExecutor::failing("division by zero"));
        let run = SingleNodeRun::new(
            &graph,
            "double",
            VariablePool::new(),
            &Map::new(),
            channel(),
            EngineLimits::default(),
            ctx(code),
        )
        .unwrap();

        let events: Vec<GraphEvent> = run.run().collect().await;
        assert_eq!(events[events.len() - 2].name(), "node-failed");
        assert!(matches!(
            events.last(),
            Some(GraphEvent::RunFailed {
                kind: RunFailureKind::NodeFailure,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let graph = workflow_graph();
        let err = SingleNodeRun::new(
            &graph,
            "missing",
            VariablePool::new(),
            &Map::new(),
            channel(),
            EngineLimits::default(),
            ExecutionContext::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StrandError::NodeNotFound(_)));
    }

    fn nested_graph() -> Arc<Graph> {
        let it = node(
            "it",
            "iteration",
            json!({
                "iterator_selector": ["start", "items"],
                "output_selector": ["double", "y"],
                "start_node_id": "double",
            }),
        );
        let mut double = code_node("double", &[("x", &["it", "item"])], &[("y", "number")]);
        double["container_id"] = json!("it");
        let desc = GraphDescription::from_value(workflow(
            vec![start_node(&["items"]), it, double, end_node("end", &[("out", &["it", "output"])])],
            vec![edge("start", "it"), edge("it", "end")],
        ))
        .unwrap();
        Graph::build(&desc, &StrategyRegistry::default()).unwrap()
    }

    async fn terminal_output(run: SingleNodeRun) -> Option<Segment> {
        let events: Vec<GraphEvent> = run.run().collect().await;
        match events.last() {
            Some(GraphEvent::RunSucceeded { outputs, .. }) => outputs.get("y").cloned(),
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_node_inside_iteration_sees_first_item() {
        let graph = nested_graph();
        let inputs = json!({"start.items": [5, 6]}).as_object().cloned().unwrap();
        let run = SingleNodeRun::new(
            &graph,
            "double",
            VariablePool::new(),
            &inputs,
            channel(),
            EngineLimits::default(),
            ctx(doubling()),
        )
        .unwrap();
        assert_eq!(run.pool.get(&Selector::new("it", &["index"])), Some(Segment::Integer(0)));
        assert_eq!(terminal_output(run).await, Some(Segment::Integer(10)));
    }

    #[tokio::test]
    async fn test_caller_item_overrides_container_seed() {
        let graph = nested_graph();
        let inputs = json!({"start.items": [5, 6], "it.item": 9})
            .as_object()
            .cloned()
            .unwrap();
        let run = SingleNodeRun::new(
            &graph,
            "double",
            VariablePool::new(),
            &inputs,
            channel(),
            EngineLimits::default(),
            ctx(doubling()),
        )
        .unwrap();
        assert_eq!(terminal_output(run).await, Some(Segment::Integer(18)));
    }

    #[test]
    fn test_start_node_rejected() {
        let graph = workflow_graph();
        let err = SingleNodeRun::new(
            &graph,
            "start",
            VariablePool::new(),
            &Map::new(),
            channel(),
            EngineLimits::default(),
            ExecutionContext::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StrandError::InvalidGraph(_)));
    }

    #[tokio::test]
    async fn test_stop_command_ends_run() {
        let desc = GraphDescription::from_value(workflow(
            vec![start_node(&[]), llm_node("llm", "hello")],
            vec![edge("start", "llm")],
        ))
        .unwrap();
        let graph = Graph::build(&desc, &StrategyRegistry::default()).unwrap();
        let llm = Arc::new(
            ScriptedLlm::repeating(ScriptedLlm::chunked(&["a", "b", "c", "d"]))
                .with_chunk_delay(std::time::Duration::from_millis(200)),
        );
        let ctx = ExecutionContext {
            services: Services::new().with_llm(llm),
            ..Default::default()
        };
        let commands = channel();
        commands
            .send(Command::Stop { reason: Some("enough".into()) })
            .await
            .unwrap();
        let run = SingleNodeRun::new(
            &graph,
            "llm",
            VariablePool::new(),
            &Map::new(),
            commands,
            EngineLimits::default(),
            ctx,
        )
        .unwrap();

        let events: Vec<GraphEvent> = run.run().collect().await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["run-started", "node-started", "run-stopped"]);
        assert!(matches!(
            events.last(),
            Some(GraphEvent::RunStopped { reason }) if reason.as_str() == "enough"
        ));
    }
}
