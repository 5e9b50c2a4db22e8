use serde_json::{json, Value};

/// Generic node description.
pub fn node(id: &str, node_type: &str, config: Value) -> Value {
    json!({"id": id, "type": node_type, "config": config})
}

/// Linear edge using the default handle.
pub fn edge(source: &str, target: &str) -> Value {
    json!({"source": source, "target": target})
}

pub fn branch_edge(source: &str, target: &str, handle: &str) -> Value {
    json!({"source": source, "target": target, "source_handle": handle})
}

pub fn workflow(nodes: Vec<Value>, edges: Vec<Value>) -> Value {
    json!({"nodes": nodes, "edges": edges})
}

/// Start node declaring string inputs.
pub fn start_node(variables: &[&str]) -> Value {
    let vars: Vec<Value> = variables
        .iter()
        .map(|v| json!({"variable": v, "type": "string", "required": false}))
        .collect();
    node("start", "start", json!({"variables": vars}))
}

/// End node mapping `(output name, selector)` pairs.
pub fn end_node(id: &str, outputs: &[(&str, &[&str])]) -> Value {
    let outs: Vec<Value> = outputs
        .iter()
        .map(|(name, sel)| json!({"variable": name, "value_selector": sel}))
        .collect();
    node(id, "end", json!({"outputs": outs}))
}

/// If-else node with one `true` case over a single condition.
pub fn if_else_node(id: &str, selector: &[&str], operator: &str, value: &str) -> Value {
    node(
        id,
        "if-else",
        json!({
            "cases": [{
                "case_id": "true",
                "logical_operator": "and",
                "conditions": [{
                    "variable_selector": selector,
                    "comparison_operator": operator,
                    "value": value,
                }]
            }]
        }),
    )
}

pub fn llm_node(id: &str, prompt: &str) -> Value {
    node(
        id,
        "llm",
        json!({
            "model": {"provider": "test", "name": "test-model"},
            "prompt_template": [{"role": "user", "text": prompt}],
        }),
    )
}

/// Code node with `(name, selector)` inputs and declared outputs.
pub fn code_node(id: &str, inputs: &[(&str, &[&str])], outputs: &[(&str, &str)]) -> Value {
    let vars: Vec<Value> = inputs
        .iter()
        .map(|(name, sel)| json!({"variable": name, "value_selector": sel}))
        .collect();
    let outs: serde_json::Map<String, Value> = outputs
        .iter()
        .map(|(name, ty)| (name.to_string(), json!({"type": ty})))
        .collect();
    node(
        id,
        "code",
        json!({"code_language": "python3", "code": "def main(**kw): ...", "variables": vars, "outputs": outs}),
    )
}

/// Template-transform style answer node: an `llm`-free aggregator that
/// echoes a single selector.
pub fn aggregator_node(id: &str, selectors: &[&[&str]]) -> Value {
    node(
        id,
        "variable-aggregator",
        json!({"output_type": "string", "variables": selectors}),
    )
}
