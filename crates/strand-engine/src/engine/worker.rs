use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use strand_core::types::AgentLog;
use strand_core::variables::Selector;

use crate::graph::GraphNode;
use crate::nodes::{NodeError, NodeOutput, NodeResult, NodeRunContext};

/// What a worker reports back to the scheduler.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Chunk { selector: Selector, text: String },
    Log(AgentLog),
    Retry { attempt: u32, error: String },
    Finished(NodeResult),
}

#[derive(Debug)]
pub(crate) struct WorkerMessage {
    /// Route index of the dispatch this message belongs to.
    pub index: usize,
    pub event: WorkerEvent,
}

/// Run one node on its own task, retrying recoverable failures.
///
/// The worker never touches the pool or route state: everything goes back
/// through `tx`, and the task exits once `Finished` is sent or the scheduler
/// has gone away.
pub(crate) fn spawn(
    index: usize,
    node: GraphNode,
    ctx: NodeRunContext,
    tx: mpsc::Sender<WorkerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let send = |event| {
            let tx = tx.clone();
            async move { tx.send(WorkerMessage { index, event }).await.is_ok() }
        };
        let mut attempt = 0;
        loop {
            let result = match AssertUnwindSafe(run_once(index, &node, ctx.clone(), &tx))
                .catch_unwind()
                .await
            {
                Ok(Some(result)) => result,
                // scheduler dropped the receiver
                Ok(None) => return,
                Err(panic) => {
                    let message = panic_message(panic);
                    error!(node_id = %node.id, panic = %message, "Node strategy panicked");
                    Err(NodeError::fatal("InternalError", format!("strategy panicked: {message}")))
                }
            };

            match result {
                Err(e)
                    if !e.is_fatal()
                        && attempt < node.retry.max_retries
                        && !ctx.exec.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(node_id = %node.id, attempt, error = %e, "Retrying node");
                    if !send(WorkerEvent::Retry { attempt, error: e.to_string() }).await {
                        return;
                    }
                    let interval = Duration::from_millis(node.retry.retry_interval_ms);
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = ctx.exec.cancel.cancelled() => {
                            send(WorkerEvent::Finished(Err(e))).await;
                            return;
                        }
                    }
                }
                other => {
                    send(WorkerEvent::Finished(other)).await;
                    return;
                }
            }
        }
    })
}

/// Drive the strategy stream once. `None` when the scheduler is gone.
async fn run_once(
    index: usize,
    node: &GraphNode,
    ctx: NodeRunContext,
    tx: &mpsc::Sender<WorkerMessage>,
) -> Option<NodeResult> {
    let mut stream = node.strategy.clone().run(ctx);
    while let Some(item) = stream.next().await {
        let event = match item {
            NodeOutput::Chunk { selector, text } => WorkerEvent::Chunk { selector, text },
            NodeOutput::Log(log) => WorkerEvent::Log(log),
            NodeOutput::Done(result) => return Some(result),
        };
        if tx.send(WorkerMessage { index, event }).await.is_err() {
            return None;
        }
    }
    Some(Err(NodeError::fatal(
        "InternalError",
        "node stream ended without a result",
    )))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use serde_json::json;
    use strand_core::context::Services;
    use strand_core::route::NodeRunResult;
    use strand_core::variables::VariablePool;

    use crate::graph::{NodeDescription, NodeType, RetryConfig};
    use crate::nodes::testing::ctx;
    use crate::nodes::{done, NodeStrategy, NodeStream};

    struct Flaky {
        fail_times: u32,
        calls: AtomicU32,
    }

    impl NodeStrategy for Flaky {
        fn node_type(&self) -> NodeType {
            NodeType::Code
        }
        fn reads(&self) -> Vec<Selector> {
            vec![]
        }
        fn run(self: Arc<Self>, _ctx: NodeRunContext) -> NodeStream {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                done(Err(NodeError::recoverable("CodeExecutionError", "flaky")))
            } else {
                done(Ok(NodeRunResult::default().output("n", n as i64)))
            }
        }
    }

    struct Panics;

    impl NodeStrategy for Panics {
        fn node_type(&self) -> NodeType {
            NodeType::Code
        }
        fn reads(&self) -> Vec<Selector> {
            vec![]
        }
        fn run(self: Arc<Self>, _ctx: NodeRunContext) -> NodeStream {
            panic!("boom")
        }
    }

    fn graph_node(strategy: Arc<dyn NodeStrategy>, max_retries: u32) -> GraphNode {
        let mut desc = NodeDescription::new("n", "code", json!({}));
        desc.retry = Some(RetryConfig {
            max_retries,
            retry_interval_ms: 1,
        });
        GraphNode::new(&desc, NodeType::Code, strategy)
    }

    async fn drain(node: GraphNode) -> Vec<WorkerEvent> {
        let (tx, mut rx) = mpsc::channel(8);
        spawn(1, node, ctx("n", VariablePool::new(), Services::new()), tx);
        let mut events = Vec::new();
        while let Some(msg) = rx.recv().await {
            assert_eq!(msg.index, 1);
            events.push(msg.event);
        }
        events
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let strategy = Arc::new(Flaky {
            fail_times: 2,
            calls: AtomicU32::new(0),
        });
        let events = drain(graph_node(strategy, 3)).await;
        assert!(matches!(events[0], WorkerEvent::Retry { attempt: 1, .. }));
        assert!(matches!(events[1], WorkerEvent::Retry { attempt: 2, .. }));
        assert!(matches!(&events[2], WorkerEvent::Finished(Ok(_))));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let strategy = Arc::new(Flaky {
            fail_times: 5,
            calls: AtomicU32::new(0),
        });
        let events = drain(graph_node(strategy, 1)).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], WorkerEvent::Finished(Err(e)) if !e.is_fatal()));
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal() {
        let events = drain(graph_node(Arc::new(Panics), 3)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Finished(Err(e)) if e.is_fatal()));
    }
}
