//! Node lifecycle commands: create, delete, list, get, interrupt.
//!
//! Creation also starts the per-node monitor task that polls the node's
//! state and broadcasts state-change events, and - for provider-configured
//! nodes - brings up the proxy side-server before the node exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nerve_core::node::{BashNode, LlmConfig, LlmNode, McpNode, NodeState, TerminalNode};
use nerve_core::node::terminal::TerminalOptions;
use nerve_core::Node;
use nerve_core::Session;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::protocols::{Event, EventSink, EventType};
use crate::proxy::{ProviderConfig, ProxyManager};
use crate::session_registry::SessionRegistry;
use crate::validation::{
    get_node, optional_duration, optional_str, optional_str_map, require_str,
};

/// How often node monitors poll for state changes.
const MONITOR_INTERVAL: Duration = Duration::from_millis(300);

pub struct NodeLifecycleHandler {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
    proxy_manager: Arc<ProxyManager>,
    monitors: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

fn monitor_key(session_id: &str, node_id: &str) -> String {
    format!("{session_id}/{node_id}")
}

impl NodeLifecycleHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn EventSink>,
        proxy_manager: Arc<ProxyManager>,
    ) -> Self {
        Self {
            registry,
            sink,
            proxy_manager,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// `CREATE_NODE {node_id, node_type?, command?, pane_id?, cwd?, env?,
    /// timeout?, ready_timeout?, response_timeout?, provider?, base_url?,
    /// model?, api_key?}`
    ///
    /// `node_type` (alias `backend`) is one of `pty` (default), `wezterm`,
    /// `bash`, `llm`, `mcp`.
    pub async fn create_node(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let node_type = optional_str(params, "node_type")
            .or_else(|| optional_str(params, "backend"))
            .unwrap_or("pty");

        let mut env = optional_str_map(params, "env");

        // Provider-configured nodes get their proxy first, so the child
        // process can connect from its very first request.
        let mut proxy_started = false;
        if let Some(provider) = params.get("provider").filter(|v| !v.is_null()) {
            let config = ProviderConfig::from_value(provider)?;
            let port = self.proxy_manager.start_proxy(node_id, config).await?;
            env.insert(
                "ANTHROPIC_BASE_URL".to_string(),
                format!("http://127.0.0.1:{port}"),
            );
            proxy_started = true;
        }

        let created = self
            .build_node(&session, node_id, node_type, params, env)
            .await;

        let info = match created {
            Ok(info) => info,
            Err(e) => {
                if proxy_started {
                    self.proxy_manager.stop_proxy(node_id).await;
                }
                return Err(e);
            }
        };

        self.spawn_monitor(&session, node_id);

        self.sink
            .emit(Event::new(
                EventType::NodeCreated,
                Some(node_id.to_string()),
                json!({"node_id": node_id, "node_type": node_type, "session_id": session.id}),
            ))
            .await;

        Ok(info)
    }

    async fn build_node(
        &self,
        session: &Arc<Session>,
        node_id: &str,
        node_type: &str,
        params: &Value,
        env: HashMap<String, String>,
    ) -> Result<Value> {
        let cwd = optional_str(params, "cwd").map(Into::into);

        match node_type {
            "pty" | "terminal" => {
                let options = TerminalOptions {
                    cwd,
                    env,
                    ready_timeout: optional_duration(params, "ready_timeout")
                        .unwrap_or(Duration::from_secs(60)),
                    response_timeout: optional_duration(params, "response_timeout")
                        .unwrap_or(Duration::from_secs(1800)),
                };
                let node = TerminalNode::create_pty(
                    node_id,
                    session,
                    optional_str(params, "command"),
                    options,
                )
                .await?;
                Ok(json!({
                    "node_id": node_id,
                    "node_type": "terminal",
                    "backend": "pty",
                    "state": node.state(),
                }))
            }
            "wezterm" => {
                let options = TerminalOptions {
                    cwd,
                    env,
                    ready_timeout: optional_duration(params, "ready_timeout")
                        .unwrap_or(Duration::from_secs(60)),
                    response_timeout: optional_duration(params, "response_timeout")
                        .unwrap_or(Duration::from_secs(1800)),
                };
                let node = match optional_str(params, "pane_id") {
                    Some(pane_id) => {
                        TerminalNode::attach_wezterm(node_id, session, pane_id, options).await?
                    }
                    None => {
                        TerminalNode::create_wezterm(
                            node_id,
                            session,
                            optional_str(params, "command"),
                            options,
                        )
                        .await?
                    }
                };
                Ok(json!({
                    "node_id": node_id,
                    "node_type": "terminal",
                    "backend": "wezterm",
                    "state": node.state(),
                }))
            }
            "bash" => {
                let node = BashNode::create(
                    node_id,
                    session,
                    cwd,
                    env,
                    optional_duration(params, "timeout"),
                )?;
                Ok(json!({
                    "node_id": node_id,
                    "node_type": "bash",
                    "state": node.state(),
                }))
            }
            "llm" => {
                let base_url = require_str(params, "base_url")?;
                let model = require_str(params, "model")?;
                let mut config = LlmConfig::new(base_url, model);
                if let Some(key) = optional_str(params, "api_key") {
                    config = config.with_api_key(key);
                }
                if let Some(timeout) = optional_duration(params, "timeout") {
                    config.timeout = timeout;
                }
                let node = LlmNode::create(node_id, session, config)?;
                Ok(json!({
                    "node_id": node_id,
                    "node_type": "llm",
                    "state": node.state(),
                }))
            }
            "mcp" => {
                let command = require_str(params, "command")?;
                let argv: Vec<String> =
                    command.split_whitespace().map(str::to_string).collect();
                let node = McpNode::create(node_id, session, argv).await?;
                Ok(json!({
                    "node_id": node_id,
                    "node_type": "mcp",
                    "state": node.state(),
                    "tools": node.list_tools(),
                }))
            }
            other => Err(ServerError::InvalidParams(format!(
                "unknown node_type '{other}'"
            ))),
        }
    }

    /// Poll one node's state and broadcast changes until it disappears.
    fn spawn_monitor(&self, session: &Arc<Session>, node_id: &str) {
        let key = monitor_key(&session.id, node_id);
        let session = Arc::clone(session);
        let node_id = node_id.to_string();
        let sink = Arc::clone(&self.sink);

        let handle = tokio::spawn(async move {
            let mut last_state: Option<NodeState> = None;
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;
                let Some(node) = session.get_node(&node_id) else {
                    break;
                };
                let state = node.state();
                if last_state != Some(state) {
                    let event_type = match state {
                        NodeState::Ready => Some(EventType::NodeReady),
                        NodeState::Busy => Some(EventType::NodeBusy),
                        NodeState::Stopped => Some(EventType::NodeStopped),
                        NodeState::Error => Some(EventType::NodeError),
                        _ => None,
                    };
                    if let Some(event_type) = event_type {
                        sink.emit(Event::new(
                            event_type,
                            Some(node_id.clone()),
                            json!({"node_id": node_id, "state": state.as_str()}),
                        ))
                        .await;
                    }
                    last_state = Some(state);
                }
                if state == NodeState::Stopped {
                    break;
                }
            }
            debug!(node_id = %node_id, "node monitor exited");
        });

        if let Some(previous) = self.monitors.lock().insert(key, handle) {
            previous.abort();
        }
    }

    /// `DELETE_NODE {node_id}` - tears down monitoring and the proxy too.
    pub async fn delete_node(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;

        if let Some(monitor) = self
            .monitors
            .lock()
            .remove(&monitor_key(&session.id, node_id))
        {
            monitor.abort();
        }

        // Interrupt any in-flight execution before stopping.
        if let Some(node) = session.get_node(node_id) {
            if node.state() == NodeState::Busy {
                node.interrupt().await;
            }
        }

        let deleted = session.delete_node(node_id).await;
        if !deleted {
            return Err(nerve_core::CoreError::NotFound {
                kind: "node",
                id: node_id.to_string(),
            }
            .into());
        }

        self.proxy_manager.stop_proxy(node_id).await;

        self.sink
            .emit(Event::new(
                EventType::NodeDeleted,
                Some(node_id.to_string()),
                json!({"node_id": node_id}),
            ))
            .await;
        Ok(json!({"deleted": true, "node_id": node_id}))
    }

    /// `LIST_NODES {session_id?}`
    pub async fn list_nodes(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let nodes: Vec<Value> = session
            .list_nodes()
            .iter()
            .filter_map(|id| session.get_node(id))
            .map(|node| serde_json::to_value(node.to_info()).unwrap_or(Value::Null))
            .collect();
        Ok(json!({"nodes": nodes}))
    }

    /// `GET_NODE {node_id}`
    pub async fn get_node_info(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node = get_node(&session, require_str(params, "node_id")?)?;
        Ok(serde_json::to_value(node.to_info()).unwrap_or(Value::Null))
    }

    /// `INTERRUPT_NODE {node_id}`
    pub async fn interrupt_node(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let node = get_node(&session, node_id)?;
        node.interrupt().await;
        Ok(json!({"interrupted": true, "node_id": node_id}))
    }

    /// Abort every monitor (server shutdown).
    pub fn abort_all_monitors(&self) {
        for (_, handle) in self.monitors.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for NodeLifecycleHandler {
    fn drop(&mut self) {
        for (_, handle) in self.monitors.lock().drain() {
            handle.abort();
        }
    }
}
