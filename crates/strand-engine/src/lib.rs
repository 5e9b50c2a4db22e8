pub mod engine;
pub mod graph;
pub mod http;
pub mod layers;
pub mod nodes;
pub mod run_log;

pub use engine::{seed_inputs, GraphEngine, RunOutcome, SingleNodeRun};
pub use graph::{Graph, GraphDescription};
pub use http::ReqwestRequester;
pub use layers::{EventBusLayer, Layer, SqlitePersistenceLayer, TracingLayer};
pub use nodes::{NodeError, NodeStrategy, StrategyRegistry};
pub use run_log::RunLogger;
