//! Ephemeral LLM HTTP client node.
//!
//! Posts chat requests to a configured OpenAI-compatible base URL with an
//! exponential-backoff retry loop restricted to transient status codes.
//! Non-retryable statuses return immediately as typed upstream errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ExecutionContext, Node, NodeInfo, NodeState};
use crate::error::{CoreError, Result};
use crate::session::Session;

/// Status codes that trigger a retry with backoff.
pub const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Configuration for an LLM node.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (no trailing slash needed).
    pub base_url: String,
    /// Bearer credential, if the service requires one.
    pub api_key: Option<String>,
    /// Model requested when the input does not name one.
    pub model: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry attempts for transient failures.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Backoff cap.
    pub retry_max_delay: Duration,
}

impl LlmConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Remaps tool-call ids between upstream and local namespaces within one
/// request, so correlation survives services that rewrite ids.
#[derive(Debug, Default)]
pub struct ToolIdMap {
    to_local: HashMap<String, String>,
    to_upstream: HashMap<String, String>,
}

impl ToolIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local id for an upstream tool-call id, allocating on first sight.
    pub fn local_id(&mut self, upstream: &str) -> String {
        if let Some(local) = self.to_local.get(upstream) {
            return local.clone();
        }
        let local = format!("call_{}", self.to_local.len());
        self.to_local.insert(upstream.to_string(), local.clone());
        self.to_upstream.insert(local.clone(), upstream.to_string());
        local
    }

    /// Original upstream id for a local id, if known.
    pub fn upstream_id(&self, local: &str) -> Option<&str> {
        self.to_upstream.get(local).map(String::as_str)
    }

    /// Rewrite tool-call ids inside a message list in place.
    pub fn remap_messages(&mut self, messages: &mut [Value]) {
        for message in messages.iter_mut() {
            if let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) {
                for call in calls {
                    if let Some(id) = call.get("id").and_then(Value::as_str).map(str::to_string) {
                        call["id"] = json!(self.local_id(&id));
                    }
                }
            }
            if let Some(id) = message
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(str::to_string)
            {
                message["tool_call_id"] = json!(self.local_id(&id));
            }
        }
    }
}

/// Ephemeral node posting chat requests to an LLM service.
pub struct LlmNode {
    id: String,
    config: LlmConfig,
    client: reqwest::Client,
    state: Mutex<NodeState>,
}

impl LlmNode {
    /// Create and register an LLM node in `session`.
    pub fn create(id: &str, session: &Arc<Session>, config: LlmConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Execution(format!("failed to build http client: {e}")))?;

        let node = Arc::new(Self {
            id: id.to_string(),
            config,
            client,
            state: Mutex::new(NodeState::Ready),
        });
        session.register_node(node.clone())?;
        Ok(node)
    }

    /// Normalize the three accepted input shapes into a request body.
    ///
    /// - string → single user message
    /// - array → message list
    /// - object with `messages` → message list plus generation options
    fn build_body(&self, input: &Value) -> Result<Value> {
        let mut body = serde_json::Map::new();
        body.insert("model".into(), json!(self.config.model));

        let mut messages = match input {
            Value::String(text) => vec![json!({"role": "user", "content": text})],
            Value::Array(messages) => messages.clone(),
            Value::Object(obj) => {
                let messages = obj
                    .get("messages")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::Execution("object input requires a 'messages' array".into())
                    })?;
                for (key, value) in obj {
                    if key != "messages" {
                        body.insert(key.clone(), value.clone());
                    }
                }
                messages
            }
            other => {
                return Err(CoreError::Execution(format!(
                    "unsupported LLM input type: {other}"
                )))
            }
        };

        let mut ids = ToolIdMap::new();
        ids.remap_messages(&mut messages);

        body.insert("messages".into(), Value::Array(messages));
        Ok(Value::Object(body))
    }

    async fn post_with_retry(&self, body: &Value, exec_id: &str) -> Result<Value> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut attempt = 0u32;
        loop {
            let mut request = self.client.post(&url).json(body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }

            let outcome = request.send().await;
            match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| CoreError::Execution(format!("invalid response body: {e}")));
                    }

                    let message = response.text().await.unwrap_or_default();
                    if !RETRYABLE_STATUS.contains(&status) || attempt >= self.config.max_retries {
                        return Err(CoreError::Upstream {
                            status,
                            message: message.chars().take(500).collect(),
                        });
                    }

                    let delay = self.backoff(attempt);
                    warn!(node_id = %self.id, exec_id, status, attempt, delay_ms = delay.as_millis() as u64, "llm request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Connection-level failures retry like 5xx responses.
                    if attempt >= self.config.max_retries {
                        return Err(CoreError::Execution(format!("request failed: {e}")));
                    }
                    let delay = self.backoff(attempt);
                    warn!(node_id = %self.id, exec_id, error = %e, attempt, "llm request error, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base_delay
            .as_secs_f64()
            * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(exp.min(self.config.retry_max_delay.as_secs_f64()))
    }
}

#[async_trait]
impl Node for LlmNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "llm"
    }

    fn state(&self) -> NodeState {
        *self.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        if self.state() == NodeState::Stopped {
            return Err(CoreError::NodeStopped(self.id.clone()));
        }

        let body = self.build_body(&ctx.input)?;
        debug!(node_id = %self.id, exec_id = %ctx.exec_id, model = %self.config.model, "llm_request");

        let response = self.post_with_retry(&body, &ctx.exec_id).await?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(json!({
            "success": true,
            "output": content,
            "error": null,
            "attributes": {
                "model": response.get("model").cloned().unwrap_or(json!(self.config.model)),
                "usage": response.get("usage").cloned().unwrap_or(Value::Null),
                "finish_reason": response["choices"][0].get("finish_reason").cloned().unwrap_or(Value::Null),
                "message": response["choices"][0].get("message").cloned().unwrap_or(Value::Null),
            },
        }))
    }

    async fn stop(&self) {
        *self.state.lock() = NodeState::Stopped;
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: "llm".into(),
            state: self.state(),
            persistent: false,
            metadata: json!({
                "base_url": self.config.base_url,
                "model": self.config.model,
                "max_retries": self.config.max_retries,
            }),
        }
    }
}
