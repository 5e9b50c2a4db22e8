//! The graph engine: runs a [`Graph`] against a variable pool and yields
//! [`GraphEvent`]s.
//!
//! The engine is pull-driven. Nothing is dispatched until the caller polls
//! the stream, and dropping the stream cancels the run. Each event passes
//! through the attached [`Layer`]s before the caller sees it.

mod scheduler;
mod single_node;
mod state;
mod worker;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use strand_core::command::CommandChannel;
use strand_core::config::EngineLimits;
use strand_core::context::ExecutionContext;
use strand_core::error::{Result, StrandError};
use strand_core::event::GraphEvent;
use strand_core::route::RuntimeRouteState;
use strand_core::snapshot::RuntimeSnapshot;
use strand_core::variables::{Segment, Selector, VariablePool};

use crate::graph::Graph;
use crate::layers::{Layer, LayerSet};
use scheduler::{ReadyItem, Restore, Scheduler};
use state::Traversal;

pub use single_node::SingleNodeRun;

/// Final state of a run driven to completion.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// `None` only when the stream ended without a terminal event.
    pub terminal: Option<GraphEvent>,
    pub pool: VariablePool,
    pub outputs: BTreeMap<String, Segment>,
    pub route_state: RuntimeRouteState,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.terminal, Some(GraphEvent::RunSucceeded { .. }))
    }

    /// The error carried by a failed run.
    pub fn error(&self) -> Option<&str> {
        match &self.terminal {
            Some(GraphEvent::RunFailed { error, .. }) => Some(error),
            Some(GraphEvent::RunStopped { reason }) => Some(reason),
            _ => None,
        }
    }
}

pub struct GraphEngine {
    execution_id: String,
    graph: Arc<Graph>,
    pool: VariablePool,
    channel: Arc<dyn CommandChannel>,
    limits: EngineLimits,
    ctx: ExecutionContext,
    restore: Option<Restore>,
    layers: LayerSet,
}

impl GraphEngine {
    pub fn new(
        graph: Arc<Graph>,
        pool: VariablePool,
        channel: Arc<dyn CommandChannel>,
        limits: EngineLimits,
        ctx: ExecutionContext,
    ) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            graph,
            pool,
            channel,
            limits,
            ctx,
            restore: None,
            layers: LayerSet::default(),
        }
    }

    /// Continue a paused run from its snapshot.
    ///
    /// The graph must be the one the snapshot was taken against; every
    /// pending state must still be paused.
    pub fn resume(
        graph: Arc<Graph>,
        snapshot: RuntimeSnapshot,
        channel: Arc<dyn CommandChannel>,
        limits: EngineLimits,
        ctx: ExecutionContext,
    ) -> Result<Self> {
        let mut ready = VecDeque::with_capacity(snapshot.ready_queue.len());
        for state_id in &snapshot.ready_queue {
            let state = snapshot.route_state.get(state_id).ok_or_else(|| {
                StrandError::InvalidGraph(format!("snapshot references unknown state {state_id}"))
            })?;
            if graph.node(&state.node_id).is_none() {
                return Err(StrandError::NodeNotFound(state.node_id.clone()));
            }
            ready.push_back(ReadyItem::Resumed {
                state_id: state_id.clone(),
            });
        }
        let restore = Restore {
            route: snapshot.route_state,
            traversal: Traversal::from_parts(snapshot.edge_states, snapshot.node_states),
            ready,
            outputs: snapshot.outputs,
            steps: snapshot.steps,
            elapsed: Duration::from_millis(snapshot.elapsed_ms),
            exceptions_count: snapshot.exceptions_count,
        };
        Ok(Self {
            execution_id: snapshot.execution_id,
            graph,
            pool: snapshot.variable_pool,
            channel,
            limits,
            ctx,
            restore: Some(restore),
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

    /// Stream the run's events. Ends after the terminal event.
    pub fn run(self) -> BoxStream<'static, GraphEvent> {
        let (mut scheduler, layers, execution_id) = self.into_parts();
        let graph = scheduler.graph().clone();
        Box::pin(stream! {
            let mut guard = RunGuard::new(scheduler.cancel_token(), layers, execution_id);
            guard.start(&graph);
            while let Some(event) = scheduler.next_event().await {
                guard.observe(&event);
                yield event;
            }
            guard.end();
        })
    }

    /// Drive the run to its end, discarding intermediate events.
    pub fn run_to_end(self) -> BoxFuture<'static, RunOutcome> {
        let (mut scheduler, layers, execution_id) = self.into_parts();
        Box::pin(async move {
            let mut guard = RunGuard::new(scheduler.cancel_token(), layers, execution_id);
            guard.start(scheduler.graph());
            while let Some(event) = scheduler.next_event().await {
                guard.observe(&event);
            }
            guard.end();
            RunOutcome {
                terminal: guard.terminal.clone(),
                pool: scheduler.pool().clone(),
                outputs: scheduler.outputs().clone(),
                route_state: scheduler.route().clone(),
            }
        })
    }

    /// Collect every event of the run. Convenient in tests and the CLI.
    pub async fn collect(self) -> Vec<GraphEvent> {
        self.run().collect().await
    }

    fn into_parts(self) -> (Scheduler, LayerSet, String) {
        let scheduler = Scheduler::new(
            self.execution_id.clone(),
            self.graph,
            self.pool,
            self.channel,
            self.limits,
            self.ctx,
            self.restore,
        );
        (scheduler, self.layers, self.execution_id)
    }
}

/// Feeds a run's layers and owns its cancellation.
///
/// Dropping the guard cancels in-flight workers. If the consumer dropped the
/// stream before [`RunGuard::end`], layers still get `on_graph_end`, with
/// `None` unless a terminal event had already been observed.
struct RunGuard {
    cancel: CancellationToken,
    layers: LayerSet,
    execution_id: String,
    terminal: Option<GraphEvent>,
    ended: bool,
}

impl RunGuard {
    fn new(cancel: CancellationToken, layers: LayerSet, execution_id: String) -> Self {
        Self {
            cancel,
            layers,
            execution_id,
            terminal: None,
            ended: false,
        }
    }

    fn start(&self, graph: &Graph) {
        self.layers.graph_start(&self.execution_id, graph);
    }

    fn observe(&mut self, event: &GraphEvent) {
        self.layers.event(&self.execution_id, event);
        if event.is_terminal() {
            self.terminal = Some(event.clone());
        }
    }

    fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            self.layers.graph_end(&self.execution_id, self.terminal.as_ref());
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.ended {
            debug!(execution_id = %self.execution_id, "Run dropped before it finished");
        }
        self.end();
        self.cancel.cancel();
    }
}

/// Seed the `start` scope from caller inputs keyed by variable name.
pub fn seed_inputs(pool: &mut VariablePool, start_id: &str, inputs: &Map<String, Value>) -> Result<()> {
    for (name, value) in inputs {
        pool.add(
            &Selector::new(start_id, &[name.as_str()]),
            Segment::from_value(value.clone()),
        )?;
    }
    Ok(())
}
