use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::traits::HttpRequest;
use strand_core::variables::{template, Selector, VariablePool};

use super::{dedup_selectors, from_future, NodeResult, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodyType {
    #[default]
    None,
    Json,
    RawText,
    #[serde(rename = "x-www-form-urlencoded")]
    FormUrlencoded,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpBody {
    #[serde(rename = "type", default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpConfig {
    method: String,
    url: String,
    /// `key:value` per line.
    #[serde(default)]
    headers: String,
    /// `key:value` per line.
    #[serde(default)]
    params: String,
    #[serde(default)]
    body: HttpBody,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Parse `key:value` lines, skipping blanks. Values may contain colons.
fn parse_pairs(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let (k, v) = line.split_once(':').unwrap_or((line, ""));
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Templated outbound HTTP call.
pub struct HttpRequestNode {
    config: HttpConfig,
}

impl HttpRequestNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let mut config: HttpConfig = desc.parse_config()?;
        config.method = config.method.to_uppercase();
        if !METHODS.contains(&config.method.as_str()) {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: format!("unsupported method {}", config.method),
            });
        }
        Ok(Self { config })
    }

    fn build_request(&self, pool: &VariablePool) -> HttpRequest {
        let c = &self.config;
        let render = |s: &str| pool.convert_template(s);
        let mut headers = parse_pairs(&render(&c.headers));
        let body = match c.body.body_type {
            BodyType::None => None,
            BodyType::Json => {
                if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                    headers.push(("Content-Type".into(), "application/json".into()));
                }
                Some(render(&c.body.data))
            }
            BodyType::RawText => Some(render(&c.body.data)),
            BodyType::FormUrlencoded => {
                headers.push((
                    "Content-Type".into(),
                    "application/x-www-form-urlencoded".into(),
                ));
                let pairs = parse_pairs(&render(&c.body.data));
                Some(
                    pairs
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join("&"),
                )
            }
        };
        HttpRequest {
            method: c.method.clone(),
            url: render(&c.url),
            headers,
            params: parse_pairs(&render(&c.params)),
            body,
            timeout: Duration::from_secs(c.timeout_secs),
        }
    }

    async fn send(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let http = ctx.exec.services.http()?.clone();
        let request = self.build_request(&ctx.pool);
        debug!(node_id = %ctx.node_id, method = %request.method, url = %request.url, "Sending request");
        let inputs = serde_json::to_value(&request)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let response = tokio::select! {
            r = http.send(request) => r?,
            _ = ctx.exec.cancel.cancelled() => return Err(StrandError::Cancelled.into()),
        };

        let headers: Map<String, Value> = response
            .headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), Value::String(v.clone())))
            .collect();
        let mut result = NodeRunResult::default()
            .output("status_code", response.status_code as i64)
            .output("body", response.body)
            .output("headers", Value::Object(headers));
        result.inputs = inputs;
        result
            .process_data
            .insert("request".into(), json!({"status": response.status_code}));
        Ok(result)
    }
}

impl NodeStrategy for HttpRequestNode {
    fn node_type(&self) -> NodeType {
        NodeType::HttpRequest
    }

    fn reads(&self) -> Vec<Selector> {
        let c = &self.config;
        dedup_selectors(
            [&c.url, &c.headers, &c.params, &c.body.data]
                .into_iter()
                .flat_map(|t| template::selectors(t)),
        )
    }

    fn writes(&self) -> Vec<String> {
        vec!["status_code".into(), "body".into(), "headers".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.send(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_core::variables::Segment;
    use strand_test_utils::services::FakeHttp;

    fn node(body: Value) -> Arc<HttpRequestNode> {
        let desc = NodeDescription::new(
            "http",
            "http-request",
            json!({
                "method": "post",
                "url": "https://api.test/{{#start.id#}}",
                "headers": "Authorization: Bearer {{#env.token#}}\nX-Trace: a:b",
                "params": "verbose:1",
                "body": body,
            }),
        );
        Arc::new(HttpRequestNode::new(&desc).unwrap())
    }

    fn pool() -> VariablePool {
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["id"]), "42").unwrap();
        pool
    }

    #[test]
    fn test_parse_pairs() {
        assert_eq!(
            parse_pairs("a: 1\n\n b:c:d "),
            vec![("a".into(), "1".into()), ("b".into(), "c:d".into())]
        );
    }

    #[test]
    fn test_build_request_renders_templates() {
        let n = node(json!({"type": "json", "data": "{\"id\": \"{{#start.id#}}\"}"}));
        let req = n.build_request(&pool());
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "https://api.test/42");
        assert_eq!(req.body.as_deref(), Some("{\"id\": \"42\"}"));
        assert!(req.headers.iter().any(|(k, _)| k == "Content-Type"));
        // unresolved placeholder stays literal
        assert_eq!(req.headers[0].1, "Bearer {{#env.token#}}");
        assert_eq!(req.params, vec![("verbose".into(), "1".into())]);
    }

    #[tokio::test]
    async fn test_response_outputs() {
        let http = FakeHttp::new().with_response("https://api.test/42", 201, "{\"ok\":true}");
        let services = Services::new().with_http(Arc::new(http));
        let (_, result) = collect(node(json!({})).run(ctx("http", pool(), services))).await;
        let result = result.unwrap();
        assert_eq!(result.outputs["status_code"], Segment::Integer(201));
        assert_eq!(result.outputs["body"], Segment::from("{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_connection_error_is_recoverable() {
        let services = Services::new().with_http(Arc::new(FakeHttp::new()));
        let (_, result) = collect(node(json!({})).run(ctx("http", pool(), services))).await;
        assert_eq!(result.unwrap_err().error_type, "HttpRequestError");
    }

    #[test]
    fn test_rejects_unknown_method() {
        let desc = NodeDescription::new("http", "http-request", json!({"method": "brew", "url": "x"}));
        assert!(HttpRequestNode::new(&desc).is_err());
    }
}
