use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_core::command::{Command, CommandChannel};
use strand_core::config::EngineLimits;
use strand_core::context::ExecutionContext;
use strand_core::error::{Result, StrandError};
use strand_core::event::{GraphEvent, RunFailureKind};
use strand_core::route::{NodeRunResult, NodeStatus, RuntimeRouteState, VariableUpdate};
use strand_core::snapshot::RuntimeSnapshot;
use strand_core::variables::{Segment, Selector, VariablePool, CONVERSATION_SCOPE};

use super::state::Traversal;
use super::worker::{self, WorkerEvent, WorkerMessage};
use crate::graph::{Edge, ErrorStrategy, Graph, NodeType};
use crate::nodes::{NodeError, NodeResult, NodeRunContext};

const WORKER_CHANNEL_CAPACITY: usize = 64;
pub(super) const STOPPED_BY_USER: &str = "stopped by user command";

/// A node waiting for a worker slot.
#[derive(Debug, Clone)]
pub(crate) enum ReadyItem {
    Fresh {
        node_id: String,
        predecessor: Option<Predecessor>,
    },
    /// Paused state carried over from a snapshot.
    Resumed { state_id: String },
}

#[derive(Debug, Clone)]
pub(crate) struct Predecessor {
    pub node_id: String,
    pub state_id: String,
}

struct InFlight {
    node_id: String,
    node_type: NodeType,
    state_id: String,
    /// Events held back until this dispatch reaches the head of the commit order.
    buffered: Vec<GraphEvent>,
    result: Option<NodeResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Running,
    Done,
}

/// Everything a scheduler resumes from.
pub(crate) struct Restore {
    pub route: RuntimeRouteState,
    pub traversal: Traversal,
    pub ready: VecDeque<ReadyItem>,
    pub outputs: BTreeMap<String, Segment>,
    pub steps: usize,
    pub elapsed: Duration,
    pub exceptions_count: usize,
}

/// Single writer of the pool and route state for one run.
///
/// Workers run strategies on their own tasks and report back over one
/// channel. Results are committed strictly in dispatch-index order, and
/// only the oldest in-flight dispatch streams its events live; later ones
/// are buffered until they reach the head. Work only advances when the
/// caller asks for the next event.
pub(crate) struct Scheduler {
    execution_id: String,
    graph: Arc<Graph>,
    pool: Arc<VariablePool>,
    route: RuntimeRouteState,
    traversal: Traversal,
    ready: VecDeque<ReadyItem>,
    in_flight: BTreeMap<usize, InFlight>,
    outbox: VecDeque<GraphEvent>,
    outputs: BTreeMap<String, Segment>,
    steps: usize,
    exceptions_count: usize,
    started: Instant,
    elapsed_before: Duration,
    resumed: bool,
    pausing: Option<Option<String>>,
    phase: Phase,
    channel: Arc<dyn CommandChannel>,
    limits: EngineLimits,
    ctx: ExecutionContext,
    tx: mpsc::Sender<WorkerMessage>,
    rx: mpsc::Receiver<WorkerMessage>,
}

impl Scheduler {
    pub fn new(
        execution_id: String,
        graph: Arc<Graph>,
        pool: VariablePool,
        channel: Arc<dyn CommandChannel>,
        limits: EngineLimits,
        mut ctx: ExecutionContext,
        restore: Option<Restore>,
    ) -> Self {
        // stopping this run must not cancel the caller's token
        ctx.cancel = ctx.cancel.child_token();
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let resumed = restore.is_some();
        let restore = restore.unwrap_or_else(|| Restore {
            route: RuntimeRouteState::new(),
            traversal: Traversal::new(&graph),
            ready: VecDeque::new(),
            outputs: BTreeMap::new(),
            steps: 0,
            elapsed: Duration::ZERO,
            exceptions_count: 0,
        });
        Self {
            execution_id,
            graph,
            pool: Arc::new(pool),
            route: restore.route,
            traversal: restore.traversal,
            ready: restore.ready,
            in_flight: BTreeMap::new(),
            outbox: VecDeque::new(),
            outputs: restore.outputs,
            steps: restore.steps,
            exceptions_count: restore.exceptions_count,
            started: Instant::now(),
            elapsed_before: restore.elapsed,
            resumed,
            pausing: None,
            phase: Phase::Init,
            channel,
            limits,
            ctx,
            tx,
            rx,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn pool(&self) -> &VariablePool {
        &self.pool
    }

    pub fn route(&self) -> &RuntimeRouteState {
        &self.route
    }

    pub fn outputs(&self) -> &BTreeMap<String, Segment> {
        &self.outputs
    }

    /// Pull the next event, doing just enough work to produce it.
    pub async fn next_event(&mut self) -> Option<GraphEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            match self.phase {
                Phase::Done => return None,
                Phase::Init => self.start().await,
                Phase::Running => self.step().await,
            }
        }
    }

    async fn start(&mut self) {
        self.phase = Phase::Running;
        self.outbox.push_back(GraphEvent::RunStarted {
            execution_id: self.execution_id.clone(),
        });
        if self.resumed {
            info!(
                execution_id = %self.execution_id,
                ready = self.ready.len(),
                "Resuming run"
            );
            return;
        }

        // nested container runs were already screened by the outer run
        let guard = match self.ctx.call_depth {
            0 => self.ctx.services.guard.clone(),
            _ => None,
        };
        if let Some(guard) = guard {
            let inputs: Map<String, Value> = self
                .pool
                .scope(self.graph.root_id())
                .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.to_value())).collect())
                .unwrap_or_default();
            let query = self
                .pool
                .get(&Selector::system("query"))
                .map(|s| s.text());
            match guard.check(&inputs, query.as_deref()).await {
                Ok(Some(short)) => {
                    info!(execution_id = %self.execution_id, kind = ?short.kind, "Run short-circuited");
                    let outputs = BTreeMap::from([("answer".to_string(), Segment::String(short.answer))]);
                    self.outbox.push_back(GraphEvent::RunSucceeded {
                        outputs,
                        short_circuit: Some(short.kind),
                    });
                    self.phase = Phase::Done;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    self.fail(RunFailureKind::FatalException, format!("input guard failed: {e}"));
                    return;
                }
            }
        }

        let root = self.graph.root_id().to_string();
        self.traversal.mark_taken(&root);
        self.ready.push_back(ReadyItem::Fresh {
            node_id: root,
            predecessor: None,
        });
    }

    async fn step(&mut self) {
        if self.ctx.is_cancelled() {
            self.stop(Some("execution cancelled".into()));
            return;
        }
        if self.elapsed() > self.limits.max_execution_time {
            self.fail(
                RunFailureKind::ResourceExhausted,
                format!(
                    "max execution time {}s exceeded",
                    self.limits.max_execution_time.as_secs()
                ),
            );
            return;
        }

        match self.channel.poll().await {
            Ok(Some(Command::Stop { reason })) => {
                self.stop(reason);
                return;
            }
            Ok(Some(Command::Pause { reason })) => {
                info!(execution_id = %self.execution_id, "Pause requested");
                self.pausing = Some(reason);
            }
            Ok(None) => {}
            Err(e) => warn!(execution_id = %self.execution_id, error = %e, "Command poll failed"),
        }

        if self.pausing.is_none() {
            while self.in_flight.len() < self.limits.max_workers {
                let Some(item) = self.ready.pop_front() else {
                    break;
                };
                if self.steps >= self.limits.max_execution_steps {
                    self.fail(
                        RunFailureKind::ResourceExhausted,
                        format!(
                            "max execution steps {} exceeded",
                            self.limits.max_execution_steps
                        ),
                    );
                    return;
                }
                if let Err(e) = self.dispatch(item) {
                    self.fail(RunFailureKind::FatalException, e.to_string());
                    return;
                }
            }
        }

        if self.in_flight.is_empty() {
            if self.ready.is_empty() {
                self.succeed();
            } else if let Some(reason) = self.pausing.take() {
                self.pause(reason);
            }
            return;
        }
        if !self.outbox.is_empty() {
            return;
        }

        // on timeout, loop round to poll the command channel again
        if let Ok(Some(msg)) =
            tokio::time::timeout(self.limits.command_poll_interval, self.rx.recv()).await
        {
            self.on_message(msg);
        }
    }

    fn elapsed(&self) -> Duration {
        self.elapsed_before + self.started.elapsed()
    }

    fn dispatch(&mut self, item: ReadyItem) -> Result<()> {
        let (node_id, state_id, index, predecessor_node_id) = match item {
            ReadyItem::Fresh {
                node_id,
                predecessor,
            } => {
                let state = self.route.create_node_state(&node_id);
                let (state_id, index) = (state.state_id.clone(), state.index);
                if let Some(p) = &predecessor {
                    self.route.add_route(&p.state_id, &state_id);
                }
                (node_id, state_id, index, predecessor.map(|p| p.node_id))
            }
            ReadyItem::Resumed { state_id } => {
                let state = self.route.resume_state(&state_id)?;
                let (node_id, index) = (state.node_id.clone(), state.index);
                let predecessor = self.predecessor_of(&state_id);
                (node_id, state_id, index, predecessor)
            }
        };
        let node = self
            .graph
            .node(&node_id)
            .ok_or_else(|| StrandError::NodeNotFound(node_id.clone()))?
            .clone();
        self.steps += 1;

        debug!(
            execution_id = %self.execution_id,
            node_id = %node_id,
            node_type = %node.node_type,
            index,
            "Dispatching node"
        );
        self.in_flight.insert(
            index,
            InFlight {
                node_id: node_id.clone(),
                node_type: node.node_type,
                state_id: state_id.clone(),
                buffered: Vec::new(),
                result: None,
            },
        );
        self.emit_for(
            index,
            GraphEvent::NodeStarted {
                node_id: node_id.clone(),
                node_type: node.node_type.to_string(),
                state_id,
                index,
                predecessor_node_id,
            },
        );

        let ctx = NodeRunContext {
            node_id,
            pool: self.pool.clone(),
            exec: self.ctx.clone(),
            limits: self.limits,
        };
        worker::spawn(index, node, ctx, self.tx.clone());
        Ok(())
    }

    fn predecessor_of(&self, state_id: &str) -> Option<String> {
        self.route
            .routes
            .iter()
            .find(|(_, targets)| targets.iter().any(|t| t == state_id))
            .and_then(|(source, _)| self.route.get(source))
            .map(|s| s.node_id.clone())
    }

    /// Emit now if `index` heads the commit order, otherwise hold it back.
    fn emit_for(&mut self, index: usize, event: GraphEvent) {
        let head = self.in_flight.keys().next().copied();
        if head == Some(index) {
            self.outbox.push_back(event);
        } else if let Some(flight) = self.in_flight.get_mut(&index) {
            flight.buffered.push(event);
        }
    }

    fn on_message(&mut self, msg: WorkerMessage) {
        let Some(flight) = self.in_flight.get(&msg.index) else {
            return;
        };
        let (node_id, state_id) = (flight.node_id.clone(), flight.state_id.clone());
        let event = match msg.event {
            WorkerEvent::Chunk { selector, text } => GraphEvent::StreamChunk {
                node_id,
                state_id,
                selector,
                chunk: text,
            },
            WorkerEvent::Log(log) => GraphEvent::AgentLog {
                node_id,
                state_id,
                log,
            },
            WorkerEvent::Retry { attempt, error } => {
                if let Err(e) = self.route.record_retry(&state_id) {
                    warn!(error = %e, "Failed to record retry");
                }
                GraphEvent::NodeRetry {
                    node_id,
                    state_id,
                    attempt,
                    error,
                }
            }
            WorkerEvent::Finished(result) => {
                if let Some(flight) = self.in_flight.get_mut(&msg.index) {
                    flight.result = Some(result);
                }
                self.commit_finished();
                return;
            }
        };
        self.emit_for(msg.index, event);
    }

    /// Commit finished dispatches from the head of the index order.
    fn commit_finished(&mut self) {
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.get().result.is_none() {
                break;
            }
            let flight = entry.remove();
            self.commit(flight);
            if self.phase == Phase::Done {
                return;
            }
            if let Some(mut next) = self.in_flight.first_entry() {
                let buffered = std::mem::take(&mut next.get_mut().buffered);
                self.outbox.extend(buffered);
            }
        }
    }

    fn commit(&mut self, mut flight: InFlight) {
        match flight.result.take() {
            Some(Ok(result)) => self.commit_success(flight, result),
            Some(Err(e)) if e.is_fatal() => {
                self.record_failure(&flight, &e, None);
                self.fail(RunFailureKind::FatalException, e.to_string());
            }
            Some(Err(e)) => self.commit_failure(flight, e),
            None => {}
        }
    }

    fn commit_success(&mut self, flight: InFlight, result: NodeRunResult) {
        let pool = Arc::make_mut(&mut self.pool);
        if let Err(e) = apply_updates(pool, &result.variable_updates) {
            return self.commit_failure(flight, e.into());
        }
        if let Err(e) = pool.add_node_outputs(&flight.node_id, &result.outputs) {
            return self.commit_failure(flight, e.into());
        }
        if flight.node_type == NodeType::End {
            self.outputs
                .extend(result.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let handle = result.edge_source_handle.clone();
        let outputs = result.outputs.clone();
        let (index, elapsed_ms) = match self.route.finish(
            &flight.state_id,
            NodeStatus::Success,
            Some(result),
            None,
        ) {
            Ok(state) => (state.index, state.elapsed_ms()),
            Err(e) => return self.fail(RunFailureKind::FatalException, e.to_string()),
        };
        info!(
            execution_id = %self.execution_id,
            node_id = %flight.node_id,
            index,
            elapsed_ms,
            "Node succeeded"
        );
        self.outbox.push_back(GraphEvent::NodeSucceeded {
            node_id: flight.node_id.clone(),
            node_type: flight.node_type.to_string(),
            state_id: flight.state_id.clone(),
            index,
            outputs,
            branch: handle.clone(),
            elapsed_ms,
        });
        if flight.node_type.is_branch() {
            if let Some(handle) = &handle {
                self.outbox.push_back(GraphEvent::BranchSelected {
                    node_id: flight.node_id.clone(),
                    handle: handle.clone(),
                });
            }
        }
        self.follow_edges(&flight, |e| e.matches(handle.as_deref()));
    }

    fn commit_failure(&mut self, flight: InFlight, error: NodeError) {
        let strategy = self.graph.error_strategy(&flight.node_id);
        let Some(strategy) = strategy else {
            self.record_failure(&flight, &error, None);
            return self.fail(RunFailureKind::NodeFailure, error.to_string());
        };

        self.exceptions_count += 1;
        let mut outputs = match strategy {
            ErrorStrategy::FailBranch => BTreeMap::new(),
            ErrorStrategy::DefaultValue => self
                .graph
                .node(&flight.node_id)
                .map(|n| n.default_value.clone())
                .unwrap_or_default(),
        };
        outputs.insert("error_message".into(), Segment::String(error.message.clone()));
        outputs.insert("error_type".into(), Segment::String(error.error_type.clone()));
        if let Err(e) = Arc::make_mut(&mut self.pool).add_node_outputs(&flight.node_id, &outputs) {
            return self.fail(RunFailureKind::FatalException, e.to_string());
        }

        match strategy {
            ErrorStrategy::FailBranch => {
                self.record_failure(&flight, &error, Some(outputs));
                self.follow_edges(&flight, |e| e.is_fail_branch());
            }
            ErrorStrategy::DefaultValue => {
                let result = NodeRunResult::with_outputs(outputs.clone());
                let index = match self.route.finish(
                    &flight.state_id,
                    NodeStatus::Exception,
                    Some(result),
                    Some(error.message.clone()),
                ) {
                    Ok(state) => state.index,
                    Err(e) => return self.fail(RunFailureKind::FatalException, e.to_string()),
                };
                self.outbox.push_back(GraphEvent::NodeException {
                    node_id: flight.node_id.clone(),
                    node_type: flight.node_type.to_string(),
                    state_id: flight.state_id.clone(),
                    index,
                    error: error.to_string(),
                    outputs,
                });
                self.follow_edges(&flight, |e| e.matches(None));
            }
        }
    }

    /// Close the route state as failed and emit `node-failed`.
    fn record_failure(
        &mut self,
        flight: &InFlight,
        error: &NodeError,
        outputs: Option<BTreeMap<String, Segment>>,
    ) {
        let result = outputs.map(NodeRunResult::with_outputs);
        let index = match self.route.finish(
            &flight.state_id,
            NodeStatus::Failed,
            result,
            Some(error.message.clone()),
        ) {
            Ok(state) => state.index,
            Err(e) => {
                warn!(error = %e, "Failed to close route state");
                return;
            }
        };
        warn!(
            execution_id = %self.execution_id,
            node_id = %flight.node_id,
            error_type = %error.error_type,
            error = %error.message,
            "Node failed"
        );
        self.outbox.push_back(GraphEvent::NodeFailed {
            node_id: flight.node_id.clone(),
            node_type: flight.node_type.to_string(),
            state_id: flight.state_id.clone(),
            index,
            error: error.to_string(),
            error_type: error.error_type.clone(),
        });
    }

    fn follow_edges<F>(&mut self, flight: &InFlight, take: F)
    where
        F: Fn(&Edge) -> bool,
    {
        let graph = self.graph.clone();
        for node_id in self.traversal.advance(&graph, &flight.node_id, take) {
            self.ready.push_back(ReadyItem::Fresh {
                node_id,
                predecessor: Some(Predecessor {
                    node_id: flight.node_id.clone(),
                    state_id: flight.state_id.clone(),
                }),
            });
        }
    }

    /// Close every in-flight state without emitting node events.
    fn abandon_in_flight(&mut self, reason: &str) {
        for flight in std::mem::take(&mut self.in_flight).into_values() {
            if let Err(e) =
                self.route
                    .finish(&flight.state_id, NodeStatus::Failed, None, Some(reason.to_string()))
            {
                debug!(error = %e, "In-flight state already closed");
            }
        }
    }

    fn succeed(&mut self) {
        info!(
            execution_id = %self.execution_id,
            steps = self.steps,
            exceptions = self.exceptions_count,
            "Run succeeded"
        );
        self.outbox.push_back(GraphEvent::RunSucceeded {
            outputs: self.outputs.clone(),
            short_circuit: None,
        });
        self.phase = Phase::Done;
    }

    fn fail(&mut self, kind: RunFailureKind, error: String) {
        warn!(execution_id = %self.execution_id, kind = %kind, error = %error, "Run failed");
        self.ctx.cancel.cancel();
        self.abandon_in_flight("run aborted");
        self.outbox.push_back(GraphEvent::RunFailed {
            kind,
            error,
            exceptions_count: self.exceptions_count,
        });
        self.phase = Phase::Done;
    }

    fn stop(&mut self, reason: Option<String>) {
        info!(execution_id = %self.execution_id, "Stopping run");
        self.ctx.cancel.cancel();
        self.abandon_in_flight(STOPPED_BY_USER);
        self.outbox.push_back(GraphEvent::RunStopped {
            reason: reason.unwrap_or_else(|| STOPPED_BY_USER.to_string()),
        });
        self.phase = Phase::Done;
    }

    fn pause(&mut self, reason: Option<String>) {
        let mut ready_queue = Vec::with_capacity(self.ready.len());
        for item in std::mem::take(&mut self.ready) {
            match item {
                ReadyItem::Fresh {
                    node_id,
                    predecessor,
                } => {
                    let state_id = self.route.create_paused_state(&node_id).state_id.clone();
                    if let Some(p) = predecessor {
                        self.route.add_route(&p.state_id, &state_id);
                    }
                    ready_queue.push(state_id);
                }
                ReadyItem::Resumed { state_id } => ready_queue.push(state_id),
            }
        }
        info!(
            execution_id = %self.execution_id,
            pending = ready_queue.len(),
            "Run paused"
        );
        let snapshot = RuntimeSnapshot {
            execution_id: self.execution_id.clone(),
            variable_pool: (*self.pool).clone(),
            route_state: self.route.clone(),
            edge_states: self.traversal.edges().clone(),
            node_states: self.traversal.nodes().clone(),
            ready_queue,
            outputs: self.outputs.clone(),
            steps: self.steps,
            elapsed_ms: self.elapsed().as_millis() as u64,
            exceptions_count: self.exceptions_count,
        };
        self.outbox.push_back(GraphEvent::RunPaused {
            reason,
            snapshot: Box::new(snapshot),
        });
        self.phase = Phase::Done;
    }
}

/// Apply writes a node made outside its own scope.
fn apply_updates(pool: &mut VariablePool, updates: &[VariableUpdate]) -> Result<()> {
    for update in updates {
        if update.selector.node_id == CONVERSATION_SCOPE {
            pool.assign_conversation(update.selector.variable(), update.value.clone())?;
        } else {
            pool.add(&update.selector, update.value.clone())?;
        }
    }
    Ok(())
}
