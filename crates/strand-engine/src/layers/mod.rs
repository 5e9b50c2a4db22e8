//! Observer layers attached to a run's event stream.
//!
//! Every event is handed to each layer, in registration order, before it is
//! yielded to the caller. Layers are observers only: an error from one is
//! logged and the run carries on.

pub mod sqlite;

use std::sync::Arc;

use tracing::{debug, info, warn};

use strand_core::error::Result;
use strand_core::event::{EventBus, GraphEvent};

use crate::graph::Graph;

pub use sqlite::SqlitePersistenceLayer;

pub trait Layer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn on_graph_start(&self, _execution_id: &str, _graph: &Graph) -> Result<()> {
        Ok(())
    }

    fn on_event(&self, execution_id: &str, event: &GraphEvent) -> Result<()>;

    /// Called once when the run is over, also when the consumer dropped the
    /// stream early. `terminal` is `None` if no terminal event was seen.
    fn on_graph_end(&self, _execution_id: &str, _terminal: Option<&GraphEvent>) -> Result<()> {
        Ok(())
    }
}

/// The layers of one run, with failures contained.
#[derive(Clone, Default)]
pub(crate) struct LayerSet {
    layers: Vec<Arc<dyn Layer>>,
}

impl LayerSet {
    pub fn push(&mut self, layer: Arc<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn graph_start(&self, execution_id: &str, graph: &Graph) {
        for layer in &self.layers {
            if let Err(e) = layer.on_graph_start(execution_id, graph) {
                warn!(layer = layer.name(), error = %e, "Layer failed on graph start");
            }
        }
    }

    pub fn event(&self, execution_id: &str, event: &GraphEvent) {
        for layer in &self.layers {
            if let Err(e) = layer.on_event(execution_id, event) {
                warn!(
                    layer = layer.name(),
                    event = event.name(),
                    error = %e,
                    "Layer failed on event"
                );
            }
        }
    }

    pub fn graph_end(&self, execution_id: &str, terminal: Option<&GraphEvent>) {
        for layer in &self.layers {
            if let Err(e) = layer.on_graph_end(execution_id, terminal) {
                warn!(layer = layer.name(), error = %e, "Layer failed on graph end");
            }
        }
    }
}

/// Logs engine events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingLayer;

impl Layer for TracingLayer {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn on_graph_start(&self, execution_id: &str, graph: &Graph) -> Result<()> {
        info!(execution_id, nodes = graph.len(), root = graph.root_id(), "Run starting");
        Ok(())
    }

    fn on_event(&self, execution_id: &str, event: &GraphEvent) -> Result<()> {
        match event {
            GraphEvent::StreamChunk { .. } | GraphEvent::AgentLog { .. } => {}
            GraphEvent::NodeStarted {
                node_id,
                node_type,
                index,
                ..
            } => debug!(execution_id, node_id = %node_id, node_type = %node_type, index, "Node started"),
            GraphEvent::NodeSucceeded {
                node_id,
                elapsed_ms,
                branch,
                ..
            } => info!(execution_id, node_id = %node_id, elapsed_ms, branch = ?branch, "Node succeeded"),
            GraphEvent::NodeRetry {
                node_id,
                attempt,
                error,
                ..
            } => warn!(execution_id, node_id = %node_id, attempt, error = %error, "Node retry"),
            GraphEvent::NodeException { node_id, error, .. } => {
                warn!(execution_id, node_id = %node_id, error = %error, "Node recovered with default value")
            }
            GraphEvent::NodeFailed {
                node_id,
                error_type,
                error,
                ..
            } => warn!(
                execution_id,
                node_id = %node_id,
                error_type = %error_type,
                error = %error,
                "Node failed"
            ),
            GraphEvent::RunFailed { kind, error, .. } => {
                warn!(execution_id, kind = %kind, error = %error, "Run failed")
            }
            GraphEvent::RunStopped { reason } => info!(execution_id, reason = %reason, "Run stopped"),
            other => debug!(execution_id, event = other.name(), "Engine event"),
        }
        Ok(())
    }
}

/// Fans events out on a broadcast [`EventBus`] for async subscribers such as
/// the JSONL [`RunLogger`](crate::run_log::RunLogger).
pub struct EventBusLayer {
    bus: Arc<EventBus>,
}

impl EventBusLayer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl Layer for EventBusLayer {
    fn name(&self) -> &'static str {
        "event-bus"
    }

    fn on_event(&self, execution_id: &str, event: &GraphEvent) -> Result<()> {
        self.bus.publish(execution_id, event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strand_core::error::StrandError;

    struct Failing;

    impl Layer for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn on_event(&self, _: &str, _: &GraphEvent) -> Result<()> {
            Err(StrandError::Database("disk full".into()))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl Layer for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn on_event(&self, _: &str, event: &GraphEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.name().to_string());
            Ok(())
        }
    }

    #[test]
    fn test_failing_layer_does_not_block_others() {
        let recording = Arc::new(Recording::default());
        let mut set = LayerSet::default();
        set.push(Arc::new(Failing));
        set.push(recording.clone());
        set.event("e1", &GraphEvent::RunStarted { execution_id: "e1".into() });
        assert_eq!(*recording.0.lock().unwrap(), vec!["run-started"]);
    }

    #[tokio::test]
    async fn test_event_bus_layer_publishes() {
        let bus = Arc::new(EventBus::new(8));
        let mut rx = bus.subscribe();
        let layer = EventBusLayer::new(bus);
        layer
            .on_event("e1", &GraphEvent::RunStopped { reason: "user".into() })
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.execution_id, "e1");
        assert_eq!(received.event.name(), "run-stopped");
    }
}
