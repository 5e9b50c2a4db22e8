use serde_json::{json, Map, Value};
use uuid::Uuid;

use strand_core::types::{AgentLog, AgentLogStatus, AgentLogType, ToolCall};

fn start(log_type: AgentLogType, label: String, parent_id: Option<String>, data: Value) -> AgentLog {
    AgentLog {
        id: Uuid::new_v4().to_string(),
        parent_id,
        label,
        log_type,
        status: AgentLogStatus::Start,
        data,
        metadata: Map::new(),
    }
}

pub fn round_start(round: usize) -> AgentLog {
    start(AgentLogType::Round, format!("ROUND {round}"), None, json!({}))
}

pub fn thought_start(round_id: &str, model_id: &str) -> AgentLog {
    start(
        AgentLogType::Thought,
        format!("{model_id} Thought"),
        Some(round_id.to_string()),
        json!({}),
    )
}

pub fn tool_call_start(round_id: &str, call: &ToolCall) -> AgentLog {
    start(
        AgentLogType::ToolCall,
        format!("CALL {}", call.name),
        Some(round_id.to_string()),
        json!({
            "tool_call_id": call.id,
            "tool_call_name": call.name,
            "tool_call_args": call.arguments,
        }),
    )
}

/// Close a started log, keeping its id so consumers can pair them.
pub fn finish(
    started: &AgentLog,
    status: AgentLogStatus,
    data: Value,
    metadata: Map<String, Value>,
) -> AgentLog {
    AgentLog {
        id: started.id.clone(),
        parent_id: started.parent_id.clone(),
        label: started.label.clone(),
        log_type: started.log_type,
        status,
        data,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_keeps_identity() {
        let round = round_start(2);
        assert_eq!(round.label, "ROUND 2");
        let call = ToolCall {
            id: "c1".into(),
            name: "search".into(),
            arguments: json!({"q": "x"}),
        };
        let started = tool_call_start(&round.id, &call);
        let done = finish(&started, AgentLogStatus::Success, json!({"output": "ok"}), Map::new());
        assert_eq!(done.id, started.id);
        assert_eq!(done.parent_id.as_deref(), Some(round.id.as_str()));
        assert_eq!(done.status, AgentLogStatus::Success);
        assert_eq!(started.data["tool_call_name"], "search");
    }
}
