use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use strand_core::error::{Result, StrandError};
use strand_core::event::GraphEvent;
use strand_core::route::NodeStatus;
use strand_core::snapshot::RuntimeSnapshot;

use super::Layer;

const ABANDONED_REASON: &str = "event stream dropped before the run finished";

/// Durable record of one node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeExecutionRecord {
    pub execution_id: String,
    pub state_id: String,
    pub node_id: String,
    pub node_type: String,
    pub index: usize,
    pub status: NodeStatus,
    pub outputs_json: Option<String>,
    pub error: Option<String>,
}

/// Persists route-state transitions, run status and pause snapshots to SQLite.
pub struct SqlitePersistenceLayer {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StrandError {
    StrandError::Database(e.to_string())
}

fn status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Running => "running",
        NodeStatus::Success => "success",
        NodeStatus::Failed => "failed",
        NodeStatus::Paused => "paused",
        NodeStatus::Exception => "exception",
    }
}

fn parse_status(s: &str) -> NodeStatus {
    match s {
        "success" => NodeStatus::Success,
        "failed" => NodeStatus::Failed,
        "paused" => NodeStatus::Paused,
        "exception" => NodeStatus::Exception,
        _ => NodeStatus::Running,
    }
}

impl SqlitePersistenceLayer {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 execution_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 error TEXT,
                 started_at TEXT NOT NULL,
                 finished_at TEXT
             );

             CREATE TABLE IF NOT EXISTS node_executions (
                 state_id TEXT PRIMARY KEY,
                 execution_id TEXT NOT NULL,
                 node_id TEXT NOT NULL,
                 node_type TEXT NOT NULL,
                 idx INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 outputs_json TEXT,
                 error TEXT,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_node_exec_run
                 ON node_executions(execution_id, idx);

             CREATE TABLE IF NOT EXISTS snapshots (
                 execution_id TEXT PRIMARY KEY,
                 snapshot_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StrandError::Database(e.to_string()))
    }

    fn set_run_status(&self, execution_id: &str, status: &str, error: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let finished = (status != "running").then(|| now.clone());
        self.conn()?
            .execute(
                "INSERT INTO runs (execution_id, status, error, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(execution_id) DO UPDATE SET
                     status = excluded.status,
                     error = excluded.error,
                     finished_at = excluded.finished_at",
                params![execution_id, status, error, now, finished],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn finish_node(
        &self,
        state_id: &str,
        status: NodeStatus,
        outputs_json: Option<String>,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE node_executions
                 SET status = ?2, outputs_json = ?3, error = ?4, updated_at = ?5
                 WHERE state_id = ?1",
                params![
                    state_id,
                    status_str(status),
                    outputs_json,
                    error,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Node executions of one run in dispatch order.
    pub fn node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, state_id, node_id, node_type, idx, status, outputs_json, error
                 FROM node_executions
                 WHERE execution_id = ?1
                 ORDER BY idx",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                let status: String = row.get(5)?;
                Ok(NodeExecutionRecord {
                    execution_id: row.get(0)?,
                    state_id: row.get(1)?,
                    node_id: row.get(2)?,
                    node_type: row.get(3)?,
                    index: row.get::<_, i64>(4)? as usize,
                    status: parse_status(&status),
                    outputs_json: row.get(6)?,
                    error: row.get(7)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Latest recorded status of a run (`running`, `succeeded`, `failed`, `stopped`, `paused`).
    pub fn run_status(&self, execution_id: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT status FROM runs WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    /// Snapshot saved when the run paused, if any.
    pub fn load_snapshot(&self, execution_id: &str) -> Result<Option<RuntimeSnapshot>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|s| RuntimeSnapshot::from_json(&s)).transpose()
    }

    pub fn delete_snapshot(&self, execution_id: &str) -> Result<usize> {
        self.conn()?
            .execute(
                "DELETE FROM snapshots WHERE execution_id = ?1",
                params![execution_id],
            )
            .map_err(db_err)
    }
}

impl Layer for SqlitePersistenceLayer {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn on_graph_end(&self, execution_id: &str, terminal: Option<&GraphEvent>) -> Result<()> {
        if terminal.is_some() {
            return Ok(());
        }
        self.conn()?
            .execute(
                "UPDATE node_executions SET status = 'failed', error = ?2, updated_at = ?3
                 WHERE execution_id = ?1 AND status = 'running'",
                params![execution_id, ABANDONED_REASON, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        self.set_run_status(execution_id, "abandoned", Some(ABANDONED_REASON))
    }

    fn on_event(&self, execution_id: &str, event: &GraphEvent) -> Result<()> {
        match event {
            GraphEvent::RunStarted { .. } => self.set_run_status(execution_id, "running", None),
            GraphEvent::NodeStarted {
                node_id,
                node_type,
                state_id,
                index,
                ..
            } => {
                self.conn()?
                    .execute(
                        "INSERT INTO node_executions
                             (state_id, execution_id, node_id, node_type, idx, status, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)
                         ON CONFLICT(state_id) DO UPDATE SET
                             status = 'running', updated_at = excluded.updated_at",
                        params![
                            state_id,
                            execution_id,
                            node_id,
                            node_type,
                            *index as i64,
                            Utc::now().to_rfc3339()
                        ],
                    )
                    .map_err(db_err)?;
                Ok(())
            }
            GraphEvent::NodeSucceeded {
                state_id, outputs, ..
            } => self.finish_node(
                state_id,
                NodeStatus::Success,
                Some(serde_json::to_string(outputs)?),
                None,
            ),
            GraphEvent::NodeException {
                state_id,
                outputs,
                error,
                ..
            } => self.finish_node(
                state_id,
                NodeStatus::Exception,
                Some(serde_json::to_string(outputs)?),
                Some(error),
            ),
            GraphEvent::NodeFailed {
                state_id, error, ..
            } => self.finish_node(state_id, NodeStatus::Failed, None, Some(error)),
            GraphEvent::RunSucceeded { .. } => self.set_run_status(execution_id, "succeeded", None),
            GraphEvent::RunFailed { error, .. } => {
                self.set_run_status(execution_id, "failed", Some(error))
            }
            GraphEvent::RunStopped { reason } => {
                self.set_run_status(execution_id, "stopped", Some(reason))
            }
            GraphEvent::RunPaused { snapshot, .. } => {
                self.conn()?
                    .execute(
                        "INSERT INTO snapshots (execution_id, snapshot_json, created_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(execution_id) DO UPDATE SET
                             snapshot_json = excluded.snapshot_json,
                             created_at = excluded.created_at",
                        params![execution_id, snapshot.to_json()?, Utc::now().to_rfc3339()],
                    )
                    .map_err(db_err)?;
                self.set_run_status(execution_id, "paused", None)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strand_core::event::RunFailureKind;
    use strand_core::route::RuntimeRouteState;
    use strand_core::variables::{Segment, VariablePool};

    fn temp_layer() -> (tempfile::TempDir, SqlitePersistenceLayer) {
        let dir = tempfile::tempdir().unwrap();
        let layer = SqlitePersistenceLayer::open(&dir.path().join("runs.db")).unwrap();
        (dir, layer)
    }

    fn started(state_id: &str, node_id: &str, index: usize) -> GraphEvent {
        GraphEvent::NodeStarted {
            node_id: node_id.into(),
            node_type: "code".into(),
            state_id: state_id.into(),
            index,
            predecessor_node_id: None,
        }
    }

    #[test]
    fn test_records_node_transitions() {
        let (_dir, layer) = temp_layer();
        layer
            .on_event("e1", &GraphEvent::RunStarted { execution_id: "e1".into() })
            .unwrap();
        layer.on_event("e1", &started("s1", "a", 1)).unwrap();
        layer.on_event("e1", &started("s2", "b", 2)).unwrap();
        layer
            .on_event(
                "e1",
                &GraphEvent::NodeSucceeded {
                    node_id: "a".into(),
                    node_type: "code".into(),
                    state_id: "s1".into(),
                    index: 1,
                    outputs: BTreeMap::from([("x".to_string(), Segment::Integer(1))]),
                    branch: None,
                    elapsed_ms: 3,
                },
            )
            .unwrap();
        layer
            .on_event(
                "e1",
                &GraphEvent::NodeFailed {
                    node_id: "b".into(),
                    node_type: "code".into(),
                    state_id: "s2".into(),
                    index: 2,
                    error: "boom".into(),
                    error_type: "CodeExecutionError".into(),
                },
            )
            .unwrap();
        layer
            .on_event(
                "e1",
                &GraphEvent::RunFailed {
                    kind: RunFailureKind::NodeFailure,
                    error: "boom".into(),
                    exceptions_count: 0,
                },
            )
            .unwrap();

        let records = layer.node_executions("e1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, NodeStatus::Success);
        assert!(records[0].outputs_json.as_deref().unwrap().contains("\"x\""));
        assert_eq!(records[1].status, NodeStatus::Failed);
        assert_eq!(records[1].error.as_deref(), Some("boom"));
        assert_eq!(layer.run_status("e1").unwrap().as_deref(), Some("failed"));
    }

    #[test]
    fn test_dropped_run_is_marked_abandoned() {
        let (_dir, layer) = temp_layer();
        layer
            .on_event("e3", &GraphEvent::RunStarted { execution_id: "e3".into() })
            .unwrap();
        layer.on_event("e3", &started("s1", "llm", 1)).unwrap();
        layer.on_graph_end("e3", None).unwrap();

        assert_eq!(layer.run_status("e3").unwrap().as_deref(), Some("abandoned"));
        let records = layer.node_executions("e3").unwrap();
        assert_eq!(records[0].status, NodeStatus::Failed);
    }

    #[test]
    fn test_graph_end_keeps_terminal_status() {
        let (_dir, layer) = temp_layer();
        let stopped = GraphEvent::RunStopped { reason: "user".into() };
        layer.on_event("e4", &stopped).unwrap();
        layer.on_graph_end("e4", Some(&stopped)).unwrap();
        assert_eq!(layer.run_status("e4").unwrap().as_deref(), Some("stopped"));
    }

    #[test]
    fn test_pause_snapshot_roundtrip() {
        let (_dir, layer) = temp_layer();
        let snapshot = RuntimeSnapshot {
            execution_id: "e2".into(),
            variable_pool: VariablePool::new(),
            route_state: RuntimeRouteState::new(),
            edge_states: BTreeMap::new(),
            node_states: BTreeMap::new(),
            ready_queue: vec!["s9".into()],
            outputs: BTreeMap::new(),
            steps: 4,
            elapsed_ms: 120,
            exceptions_count: 0,
        };
        layer
            .on_event(
                "e2",
                &GraphEvent::RunPaused {
                    reason: None,
                    snapshot: Box::new(snapshot.clone()),
                },
            )
            .unwrap();
        assert_eq!(layer.load_snapshot("e2").unwrap(), Some(snapshot));
        assert_eq!(layer.run_status("e2").unwrap().as_deref(), Some("paused"));
        assert_eq!(layer.delete_snapshot("e2").unwrap(), 1);
        assert_eq!(layer.load_snapshot("e2").unwrap(), None);
    }
}
