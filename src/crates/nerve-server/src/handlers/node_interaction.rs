//! Node interaction commands: execute input, read buffers, raw writes.

use std::str::FromStr;
use std::sync::Arc;

use nerve_core::node::ExecutionContext;
use nerve_core::parser::ParserKind;
use serde_json::{json, Value};

use crate::error::{Result, ServerError};
use crate::session_registry::SessionRegistry;
use crate::validation::{get_node, optional_duration, optional_str, optional_u64, require_str};

pub struct NodeInteractionHandler {
    registry: Arc<SessionRegistry>,
}

impl NodeInteractionHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// `EXECUTE_INPUT {node_id, text, timeout?, parser?}` → parsed response.
    pub async fn execute_input(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let node = get_node(&session, node_id)?;

        let input = params
            .get("text")
            .or_else(|| params.get("input"))
            .cloned()
            .ok_or_else(|| {
                ServerError::InvalidParams("missing required parameter 'text'".into())
            })?;

        let parser = match optional_str(params, "parser") {
            Some(name) => Some(
                ParserKind::from_str(name)
                    .map_err(|e| ServerError::InvalidParams(e))?,
            ),
            None => None,
        };

        let ctx = ExecutionContext::new(session)
            .with_input(input)
            .with_timeout(optional_duration(params, "timeout"))
            .with_parser(parser);

        let response = node.execute(ctx).await?;
        Ok(json!({"node_id": node_id, "response": response}))
    }

    /// `READ_BUFFER {node_id}` → full buffer snapshot.
    pub async fn read_buffer(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let node = get_node(&session, node_id)?;

        let buffer = node.read().await?;
        Ok(json!({"node_id": node_id, "buffer": buffer}))
    }

    /// `READ_TAIL {node_id, lines?}` → last N lines (default 50).
    pub async fn read_tail(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let node = get_node(&session, node_id)?;

        let lines = optional_u64(params, "lines").unwrap_or(50) as usize;
        let buffer = node.read_tail(lines).await?;
        Ok(json!({"node_id": node_id, "buffer": buffer, "lines": lines}))
    }

    /// `WRITE_RAW {node_id, data}` → raw write, no response parsing.
    pub async fn write_raw(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let data = require_str(params, "data")?;
        let node = get_node(&session, node_id)?;

        node.write(data).await?;
        Ok(json!({"node_id": node_id, "written": true}))
    }

    /// `RUN_COMMAND {node_id, command}` → fire-and-forget program start.
    pub async fn run_command(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let command = require_str(params, "command")?;
        let node = get_node(&session, node_id)?;

        node.run(command).await?;
        Ok(json!({"node_id": node_id, "started": true, "command": command}))
    }
}
