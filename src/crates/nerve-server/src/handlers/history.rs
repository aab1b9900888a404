//! History read commands.
//!
//! Reads are graceful: a node that never wrote history (or does not exist)
//! yields an empty entry list with a note, not an error - debugging reads
//! should never fail a client script.

use std::sync::Arc;

use nerve_core::history::HistoryReader;
use serde_json::{json, Value};

use crate::error::Result;
use crate::session_registry::SessionRegistry;
use crate::validation::{optional_bool, optional_str, optional_u64, require_str};

pub struct HistoryHandler {
    registry: Arc<SessionRegistry>,
}

impl HistoryHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// `GET_HISTORY {node_id, session_id?, last?, op?, seq?, inputs_only?}`
    pub async fn get_history(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let node_id = require_str(params, "node_id")?;
        let server_name = self.registry.server_name();

        let base_dir = session.history_base_dir.read().clone();
        let reader = match HistoryReader::create(
            node_id,
            server_name,
            &session.id,
            base_dir.as_deref(),
        ) {
            Ok(reader) => reader,
            Err(_) => {
                return Ok(json!({
                    "node_id": node_id,
                    "server_name": server_name,
                    "session_id": session.id,
                    "entries": [],
                    "total": 0,
                    "note": "no history recorded for this node",
                }))
            }
        };

        let entries = if let Some(seq) = optional_u64(params, "seq") {
            reader.get_by_seq(seq).into_iter().collect()
        } else if let Some(op) = optional_str(params, "op") {
            reader.get_by_op(op)
        } else if optional_bool(params, "inputs_only").unwrap_or(false) {
            reader.get_inputs_only()
        } else if let Some(last) = optional_u64(params, "last") {
            reader.get_last(last as usize)
        } else {
            reader.get_all()
        };

        Ok(json!({
            "node_id": node_id,
            "server_name": server_name,
            "session_id": session.id,
            "total": entries.len(),
            "entries": entries,
        }))
    }
}
