//! Per-node proxy lifecycle.
//!
//! A node created with a provider config gets a dedicated local side-server
//! started *before* the node itself, so the node's child process can point
//! at the local URL from its first request. One proxy per node; stopping or
//! failing one proxy never affects the others.

mod server;

pub use server::{ProxyServer, ProxyServerConfig};

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};

/// Attempts at the allocate-port/bind/health cycle before giving up.
const MAX_START_ATTEMPTS: u32 = 5;

/// Default bound on the health gate.
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream API wire format the proxy fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// Anthropic-format upstream: passthrough with credential injection.
    Anthropic,
    /// OpenAI-format upstream: requires a model override.
    Openai,
}

/// Configuration for a custom LLM provider behind a proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_format: ApiFormat,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl ProviderConfig {
    /// Parse and validate a provider config from command params.
    pub fn from_value(value: &Value) -> Result<Self> {
        let config: ProviderConfig = serde_json::from_value(value.clone())
            .map_err(|e| ServerError::InvalidParams(format!("invalid provider config: {e}")))?;
        if config.api_format == ApiFormat::Openai && config.model.is_none() {
            return Err(ServerError::InvalidParams(
                "model is required for api_format='openai'".into(),
            ));
        }
        Ok(config)
    }
}

/// A running proxy bound to one node.
pub struct ProxyInstance {
    pub node_id: String,
    pub port: u16,
    pub config: ProviderConfig,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

/// Find a free port by binding to port zero and closing the socket.
///
/// Inherently racy (close-then-reopen): the caller must retry on
/// address-in-use.
fn find_free_port() -> Result<u16> {
    let listener = StdTcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| ServerError::ProxyStart(format!("port allocation failed: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ServerError::ProxyStart(format!("port allocation failed: {e}")))?
        .port();
    Ok(port)
}

/// Manages proxy instances, one per node.
pub struct ProxyManager {
    proxies: Mutex<HashMap<String, ProxyInstance>>,
    health_timeout: Duration,
    client: reqwest::Client,
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}

impl ProxyManager {
    pub fn new(health_timeout: Duration) -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
            health_timeout,
            client: reqwest::Client::new(),
        }
    }

    /// Start a proxy for `node_id`, retrying on port collisions and failed
    /// health checks.
    pub async fn start_proxy(&self, node_id: &str, config: ProviderConfig) -> Result<u16> {
        if self.proxies.lock().contains_key(node_id) {
            return Err(ServerError::ProxyStart(format!(
                "proxy already exists for node: {node_id}"
            )));
        }

        let mut last_error = None;
        for attempt in 1..=MAX_START_ATTEMPTS {
            let port = find_free_port()?;
            debug!(node_id, port, attempt, "allocated proxy port");

            let server = ProxyServer::new(ProxyServerConfig {
                host: "127.0.0.1".to_string(),
                port,
                upstream_base_url: config.base_url.clone(),
                upstream_api_key: config.api_key.clone(),
                upstream_model: config.model.clone(),
                api_format: config.api_format,
            });

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let task = match server.spawn(shutdown_rx).await {
                Ok(task) => task,
                Err(e) => {
                    // Port reuse race: someone else bound it between the
                    // probe and our listen. Back off and re-allocate.
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    continue;
                }
            };

            match self.wait_for_health(port).await {
                Ok(()) => {
                    info!(node_id, port, upstream = %config.base_url, "proxy started");
                    self.proxies.lock().insert(
                        node_id.to_string(),
                        ProxyInstance {
                            node_id: node_id.to_string(),
                            port,
                            config,
                            shutdown: Some(shutdown_tx),
                            task,
                        },
                    );
                    return Ok(port);
                }
                Err(e) => {
                    debug!(node_id, port, attempt, "health check failed, retrying");
                    let _ = shutdown_tx.send(());
                    task.abort();
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }

        Err(ServerError::ProxyStart(format!(
            "failed to start proxy for node '{node_id}' after {MAX_START_ATTEMPTS} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn wait_for_health(&self, port: u16) -> Result<()> {
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + self.health_timeout;

        while tokio::time::Instant::now() < deadline {
            let probe = self
                .client
                .get(&url)
                .timeout(Duration::from_secs(1))
                .send()
                .await;
            if let Ok(response) = probe {
                if response.status().is_success() {
                    if let Ok(body) = response.json::<Value>().await {
                        if body.get("status").and_then(Value::as_str) == Some("ok") {
                            return Ok(());
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(ServerError::ProxyHealth(format!(
            "proxy on port {port} not healthy within {:.0}s",
            self.health_timeout.as_secs_f64()
        )))
    }

    /// Local URL for a node's proxy, if one is running.
    pub fn proxy_url(&self, node_id: &str) -> Option<String> {
        self.proxies
            .lock()
            .get(node_id)
            .map(|p| format!("http://127.0.0.1:{}", p.port))
    }

    /// Stop the proxy for one node; other proxies are unaffected.
    pub async fn stop_proxy(&self, node_id: &str) {
        let instance = self.proxies.lock().remove(node_id);
        let Some(mut instance) = instance else {
            debug!(node_id, "no proxy to stop");
            return;
        };

        info!(node_id, port = instance.port, "stopping proxy");
        if let Some(shutdown) = instance.shutdown.take() {
            let _ = shutdown.send(());
        }

        // Graceful stop completes in-flight requests; cancel after 5s.
        match tokio::time::timeout(Duration::from_secs(5), &mut instance.task).await {
            Ok(_) => debug!(node_id, "proxy stopped"),
            Err(_) => {
                warn!(node_id, "proxy did not stop gracefully, cancelling");
                instance.task.abort();
            }
        }
    }

    /// Stop all proxies concurrently (engine shutdown).
    pub async fn stop_all(&self) {
        let node_ids: Vec<String> = self.proxies.lock().keys().cloned().collect();
        if node_ids.is_empty() {
            return;
        }
        info!(count = node_ids.len(), "stopping all proxies");
        futures::future::join_all(node_ids.iter().map(|id| self.stop_proxy(id))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_config_requires_model_for_openai() {
        let value = json!({
            "api_format": "openai",
            "base_url": "https://api.example.com/v1",
            "api_key": "sk-test",
        });
        assert!(ProviderConfig::from_value(&value).is_err());

        let value = json!({
            "api_format": "openai",
            "base_url": "https://api.example.com/v1",
            "api_key": "sk-test",
            "model": "gpt-4.1",
        });
        let config = ProviderConfig::from_value(&value).unwrap();
        assert_eq!(config.api_format, ApiFormat::Openai);
    }

    #[test]
    fn anthropic_passthrough_needs_no_model() {
        let value = json!({
            "api_format": "anthropic",
            "base_url": "https://api.example.com",
            "api_key": "key",
        });
        let config = ProviderConfig::from_value(&value).unwrap();
        assert!(config.model.is_none());
    }

    #[test]
    fn free_ports_are_distinct_under_light_contention() {
        let a = find_free_port().unwrap();
        let b = find_free_port().unwrap();
        assert!(a > 0 && b > 0);
    }

    #[tokio::test]
    async fn stop_without_proxy_is_a_noop() {
        let manager = ProxyManager::default();
        manager.stop_proxy("ghost").await;
        assert!(manager.proxy_url("ghost").is_none());
    }

    #[tokio::test]
    async fn start_health_gate_and_stop() {
        let manager = ProxyManager::default();
        let config = ProviderConfig {
            api_format: ApiFormat::Anthropic,
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: "k".to_string(),
            model: None,
        };

        let port = manager.start_proxy("node-p", config).await.unwrap();
        assert_eq!(
            manager.proxy_url("node-p").unwrap(),
            format!("http://127.0.0.1:{port}")
        );

        // Second proxy for the same node is refused.
        let config = ProviderConfig {
            api_format: ApiFormat::Anthropic,
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: "k".to_string(),
            model: None,
        };
        assert!(manager.start_proxy("node-p", config).await.is_err());

        manager.stop_proxy("node-p").await;
        assert!(manager.proxy_url("node-p").is_none());
    }
}
