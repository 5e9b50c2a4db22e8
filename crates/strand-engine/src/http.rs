use futures::future::BoxFuture;
use reqwest::Method;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{HttpRequest, HttpRequester, HttpResponse};

/// Default [`HttpRequester`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestRequester {
    http: reqwest::Client,
}

impl ReqwestRequester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn http_err(e: reqwest::Error) -> StrandError {
    StrandError::Http(e.to_string())
}

impl HttpRequester for ReqwestRequester {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let method = Method::from_bytes(request.method.as_bytes())
                .map_err(|e| StrandError::Http(format!("invalid method {}: {e}", request.method)))?;
            let mut builder = self
                .http
                .request(method, &request.url)
                .timeout(request.timeout)
                .query(&request.params);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(http_err)?;
            let status_code = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = resp.text().await.map_err(http_err)?;
            debug!(url = %request.url, status = status_code, bytes = body.len(), "HTTP response");
            Ok(HttpResponse {
                status_code,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejects_invalid_method() {
        let requester = ReqwestRequester::new();
        let err = requester
            .send(HttpRequest {
                method: "BAD METHOD".into(),
                url: "http://localhost".into(),
                headers: vec![],
                params: vec![],
                body: None,
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Http(_)));
    }
}
