//! Persistent node fronting an MCP tool server.
//!
//! Connects to a tool server over stdio (child process), discovers its tool
//! catalog at start, and routes named calls. Any connection failure flips
//! the node to the Error state; it refuses further calls until deleted.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, RawContent, Tool as McpTool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::ServiceExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ExecutionContext, Node, NodeInfo, NodeState};
use crate::error::{CoreError, Result};
use crate::session::Session;

/// Node holding a persistent stdio connection to an MCP tool server.
pub struct McpNode {
    id: String,
    command: Vec<String>,
    state: Mutex<NodeState>,
    error_message: Mutex<Option<String>>,
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, ()>>>,
    tools: Mutex<Vec<McpTool>>,
}

impl McpNode {
    /// Create, connect and register an MCP node in `session`.
    ///
    /// The connection and tool discovery happen before registration; a node
    /// that never connected is not left behind in the session.
    pub async fn create(id: &str, session: &Arc<Session>, command: Vec<String>) -> Result<Arc<Self>> {
        if command.is_empty() {
            return Err(CoreError::Execution("mcp command cannot be empty".into()));
        }

        let node = Arc::new(Self {
            id: id.to_string(),
            command,
            state: Mutex::new(NodeState::Created),
            error_message: Mutex::new(None),
            service: tokio::sync::Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        });

        node.start().await?;
        session.register_node(node.clone())?;
        Ok(node)
    }

    /// Connect to the tool server and discover its catalog.
    async fn start(&self) -> Result<()> {
        *self.state.lock() = NodeState::Starting;

        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);

        let connected: Result<(RunningService<RoleClient, ()>, Vec<McpTool>)> = async {
            let transport = TokioChildProcess::new(cmd)
                .map_err(|e| CoreError::Execution(format!("failed to spawn tool server: {e}")))?;
            let service = ()
                .serve(transport)
                .await
                .map_err(|e| CoreError::Execution(format!("mcp handshake failed: {e}")))?;
            let tools = service
                .list_all_tools()
                .await
                .map_err(|e| CoreError::Execution(format!("tool discovery failed: {e}")))?;
            Ok((service, tools))
        }
        .await;

        match connected {
            Ok((service, tools)) => {
                debug!(node_id = %self.id, tool_count = tools.len(), "mcp connected");
                *self.service.lock().await = Some(service);
                *self.tools.lock() = tools;
                *self.state.lock() = NodeState::Ready;
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn fail(&self, message: String) {
        warn!(node_id = %self.id, error = %message, "mcp node entering error state");
        *self.error_message.lock() = Some(message);
        *self.state.lock() = NodeState::Error;
    }

    /// Names of the discovered tools.
    pub fn list_tools(&self) -> Vec<String> {
        self.tools.lock().iter().map(|t| t.name.to_string()).collect()
    }

    /// Call one named tool and serialize its result to a string.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<String> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| CoreError::NodeError {
            id: self.id.clone(),
            message: self
                .error_message
                .lock()
                .clone()
                .unwrap_or_else(|| "not connected".into()),
        })?;

        let params = CallToolRequestParams {
            meta: None,
            name: Cow::Owned(name.to_string()),
            arguments: args.as_object().cloned(),
            task: None,
        };

        let result: CallToolResult = match service.peer().call_tool(params).await {
            Ok(result) => result,
            Err(e) => {
                drop(guard);
                self.fail(format!("tool call failed: {e}"));
                return Err(CoreError::NodeError {
                    id: self.id.clone(),
                    message: format!("tool call failed: {e}"),
                });
            }
        };

        if result.is_error == Some(true) {
            return Err(CoreError::Execution(extract_text(&result.content)));
        }

        if let Some(structured) = result.structured_content {
            return Ok(structured.to_string());
        }
        Ok(extract_text(&result.content))
    }
}

fn extract_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accepted execute inputs: `"tool_name"`, or `{tool, args}` (also accepts
/// the MCP-style `{name, arguments}` keys).
fn parse_call(input: &Value) -> Result<(String, Value)> {
    match input {
        Value::String(name) => Ok((name.clone(), json!({}))),
        Value::Object(obj) => {
            let name = obj
                .get("tool")
                .or_else(|| obj.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::Execution("mcp input requires a 'tool' name".into()))?;
            let args = obj
                .get("args")
                .or_else(|| obj.get("arguments"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            Ok((name.to_string(), args))
        }
        other => Err(CoreError::Execution(format!(
            "unsupported mcp input: {other}"
        ))),
    }
}

#[async_trait]
impl Node for McpNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "mcp"
    }

    fn state(&self) -> NodeState {
        *self.state.lock()
    }

    fn persistent(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        match self.state() {
            NodeState::Stopped => return Err(CoreError::NodeStopped(self.id.clone())),
            NodeState::Error => {
                return Err(CoreError::NodeError {
                    id: self.id.clone(),
                    message: self
                        .error_message
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "connection lost".into()),
                })
            }
            _ => {}
        }

        let (tool, args) = parse_call(&ctx.input)?;
        debug!(node_id = %self.id, exec_id = %ctx.exec_id, %tool, "mcp_call");

        let output = self.call_tool(&tool, args).await?;
        Ok(json!({
            "success": true,
            "output": output,
            "error": null,
            "attributes": {"tool": tool},
        }))
    }

    async fn stop(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(e) = service.cancel().await {
                warn!(node_id = %self.id, error = %e, "mcp shutdown failed");
            }
        }
        *self.state.lock() = NodeState::Stopped;
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: "mcp".into(),
            state: self.state(),
            persistent: true,
            metadata: json!({
                "command": self.command,
                "tools": self.list_tools(),
                "error": *self.error_message.lock(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call_accepts_bare_name() {
        let (tool, args) = parse_call(&json!("list_files")).unwrap();
        assert_eq!(tool, "list_files");
        assert_eq!(args, json!({}));
    }

    #[test]
    fn parse_call_accepts_tool_and_args() {
        let (tool, args) = parse_call(&json!({"tool": "read", "args": {"path": "/tmp"}})).unwrap();
        assert_eq!(tool, "read");
        assert_eq!(args["path"], "/tmp");
    }

    #[test]
    fn parse_call_accepts_mcp_style_keys() {
        let (tool, args) =
            parse_call(&json!({"name": "read", "arguments": {"path": "/tmp"}})).unwrap();
        assert_eq!(tool, "read");
        assert_eq!(args["path"], "/tmp");
    }

    #[test]
    fn parse_call_rejects_other_shapes() {
        assert!(parse_call(&json!(42)).is_err());
        assert!(parse_call(&json!({"args": {}})).is_err());
    }
}
