use async_trait::async_trait;
use flowcore::{FlowData, Jober, JoberContext, NodeError};
use flowruntime::{ConfigKey, JoberFactory, JoberMetadata};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Sends one HTTP request per payload.
///
/// The target is `config.url`, or the payload's `url` field when the config
/// leaves it out. `POST`/`PUT`/`PATCH` send the business payload as the JSON
/// body. The output replaces the business payload with
/// `{status, headers, body}`; bodies that parse as JSON are kept as JSON.
/// Responses with status >= 400 fail the batch unless `failOnStatus` is false.
pub struct HttpRequestJober {
    client: reqwest::Client,
    method: Method,
    url: Option<String>,
    headers: Vec<(String, String)>,
    fail_on_status: bool,
}

impl HttpRequestJober {
    async fn send(&self, item: FlowData) -> Result<FlowData, NodeError> {
        let url = match &self.url {
            Some(url) => url.clone(),
            None => item
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| NodeError::InvalidInput("http.request needs a url".to_string()))?,
        };

        let mut request = self.client.request(self.method.clone(), &url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if matches!(self.method, Method::POST | Method::PUT | Method::PATCH) {
            request = request.json(&item.business);
        }

        tracing::debug!("{} {}", self.method, url);
        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        if self.fail_on_status && (status.is_client_error() || status.is_server_error()) {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned {}",
                self.method, url, status
            )));
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(item.with_business(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        })))
    }
}

#[async_trait]
impl Jober for HttpRequestJober {
    fn jober_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, _ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            out.push(self.send(item).await?);
        }
        Ok(out)
    }
}

pub struct HttpRequestJoberFactory;

impl JoberFactory for HttpRequestJoberFactory {
    fn create(&self, config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError> {
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = match method.as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            other => return Err(NodeError::Configuration(format!("Unsupported method: {}", other))),
        };

        let headers = match config.get("headers") {
            None => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v.as_str() {
                    Some(s) => Ok((k.clone(), s.to_string())),
                    None => Err(NodeError::Configuration(format!("header {} must be a string", k))),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(NodeError::Configuration("headers must be an object".to_string())),
        };

        let timeout = Duration::from_millis(config.get("timeoutMs").and_then(Value::as_u64).unwrap_or(30_000));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Arc::new(HttpRequestJober {
            client,
            method,
            url: config.get("url").and_then(Value::as_str).map(str::to_string),
            headers,
            fail_on_status: config.get("failOnStatus").and_then(Value::as_bool).unwrap_or(true),
        }))
    }

    fn jober_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> JoberMetadata {
        JoberMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            config_keys: vec![
                ConfigKey::new("url", "Target URL (falls back to the payload's url field)", false),
                ConfigKey::new("method", "GET, POST, PUT, PATCH or DELETE", false),
                ConfigKey::new("headers", "Object of header values", false),
                ConfigKey::new("timeoutMs", "Request timeout (default 30000)", false),
                ConfigKey::new("failOnStatus", "Fail on 4xx/5xx responses (default true)", false),
            ],
        }
    }
}
