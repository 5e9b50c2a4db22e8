use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strand_core::event::{EventBus, ExecutionEvent, GraphEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{execution_id}/{timestamp}.jsonl`. Lines already written
/// survive a crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1=run summary, 2=per-node, 3=chunks and agent logs.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write entries for `execution_id` until its terminal event or cancellation.
    pub async fn run(self, bus: Arc<EventBus>, execution_id: String, cancel: CancellationToken) {
        // subscribe first so nothing published while the file opens is lost
        let mut rx = bus.subscribe();

        let run_dir = self.log_dir.join(&execution_id);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{timestamp}.jsonl"));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };
        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => {
                        if event.execution_id != execution_id {
                            continue;
                        }
                        if let Some(entry) = self.entry(&event) {
                            if let Ok(json) = serde_json::to_string(&entry) {
                                if let Err(e) = writer.write_all(format!("{json}\n").as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        if event.event.is_terminal() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// `None` when the event is below the configured level.
    fn entry(&self, event: &ExecutionEvent) -> Option<LogEntry> {
        let level = match &event.event {
            GraphEvent::RunStarted { .. }
            | GraphEvent::RunSucceeded { .. }
            | GraphEvent::RunFailed { .. }
            | GraphEvent::RunStopped { .. }
            | GraphEvent::RunPaused { .. } => 1,
            GraphEvent::StreamChunk { .. } | GraphEvent::AgentLog { .. } => 3,
            _ => 2,
        };
        if level > self.level {
            return None;
        }

        let detail = match &event.event {
            GraphEvent::RunSucceeded {
                outputs,
                short_circuit,
            } => Some(serde_json::json!({
                "outputs": outputs.keys().collect::<Vec<_>>(),
                "short_circuit": short_circuit,
            })),
            GraphEvent::RunFailed {
                kind,
                error,
                exceptions_count,
            } => Some(serde_json::json!({
                "kind": kind,
                "error": error,
                "exceptions_count": exceptions_count,
            })),
            GraphEvent::RunStopped { reason } => Some(serde_json::json!({ "reason": reason })),
            GraphEvent::RunPaused { reason, snapshot } => Some(serde_json::json!({
                "reason": reason,
                "ready": snapshot.ready_queue.len(),
                "steps": snapshot.steps,
            })),
            GraphEvent::NodeStarted { index, node_type, .. } => {
                Some(serde_json::json!({ "index": index, "node_type": node_type }))
            }
            GraphEvent::NodeSucceeded {
                elapsed_ms, branch, ..
            } => Some(serde_json::json!({ "elapsed_ms": elapsed_ms, "branch": branch })),
            GraphEvent::NodeFailed {
                error, error_type, ..
            } => Some(serde_json::json!({ "error": error, "error_type": error_type })),
            GraphEvent::NodeException { error, .. } => Some(serde_json::json!({ "error": error })),
            GraphEvent::NodeRetry { attempt, error, .. } => {
                Some(serde_json::json!({ "attempt": attempt, "error": error }))
            }
            GraphEvent::BranchSelected { handle, .. } => {
                Some(serde_json::json!({ "handle": handle }))
            }
            GraphEvent::StreamChunk { chunk, .. } => {
                Some(serde_json::json!({ "chunk": truncate_str(chunk, 200) }))
            }
            GraphEvent::AgentLog { log, .. } => Some(serde_json::json!({
                "label": log.label,
                "log_type": log.log_type,
                "status": log.status,
            })),
            GraphEvent::RunStarted { .. } => None,
        };

        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            execution_id: event.execution_id.clone(),
            event_type: event.event.name(),
            node_id: event.event.node_id().map(str::to_string),
            detail,
        })
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn wrap(event: GraphEvent) -> ExecutionEvent {
        ExecutionEvent {
            execution_id: "e1".into(),
            timestamp: Utc::now(),
            event,
        }
    }

    fn chunk() -> GraphEvent {
        GraphEvent::StreamChunk {
            node_id: "llm".into(),
            state_id: "s".into(),
            selector: strand_core::variables::Selector::new("llm", &["text"]),
            chunk: "hello".into(),
        }
    }

    #[test]
    fn test_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .entry(&wrap(GraphEvent::RunStarted {
                execution_id: "e1".into(),
            }))
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run-started"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_level_filtering() {
        let node_event = wrap(GraphEvent::BranchSelected {
            node_id: "if".into(),
            handle: "true".into(),
        });
        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(summary.entry(&node_event).is_none());
        assert!(summary.entry(&wrap(chunk())).is_none());

        let per_node = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = per_node.entry(&node_event).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("if"));
        assert!(per_node.entry(&wrap(chunk())).is_none());

        assert!(RunLogger::new(PathBuf::from("/tmp"), 3).entry(&wrap(chunk())).is_some());
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_writes_until_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let handle = tokio::spawn(logger.run(bus.clone(), "e1".into(), CancellationToken::new()));
        tokio::task::yield_now().await;

        bus.publish("e1", GraphEvent::RunStarted { execution_id: "e1".into() });
        bus.publish("other", GraphEvent::RunStarted { execution_id: "other".into() });
        bus.publish("e1", GraphEvent::RunStopped { reason: "user".into() });
        handle.await.unwrap();

        let run_dir = dir.path().join("e1");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("run-stopped"));
    }
}
