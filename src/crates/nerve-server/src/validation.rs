//! Command parameter helpers and common lookups.
//!
//! Handlers pull their required fields through these; a missing or
//! mistyped field becomes `InvalidParams`, a failed lookup `NotFound`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nerve_core::graph::Graph;
use nerve_core::node::Node;
use nerve_core::workflow::Workflow;
use nerve_core::{CoreError, Session};
use serde_json::Value;

use crate::error::{Result, ServerError};

/// Required string parameter.
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::InvalidParams(format!("missing required parameter '{key}'")))
}

/// Optional string parameter.
pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Optional boolean parameter.
pub fn optional_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(Value::as_bool)
}

/// Optional unsigned integer parameter.
pub fn optional_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

/// Optional duration parameter given in (fractional) seconds.
pub fn optional_duration(params: &Value, key: &str) -> Option<Duration> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Optional string-to-string map parameter (e.g. environment variables).
pub fn optional_str_map(params: &Value, key: &str) -> HashMap<String, String> {
    params
        .get(key)
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Node lookup that raises on missing.
pub fn get_node(session: &Arc<Session>, node_id: &str) -> Result<Arc<dyn Node>> {
    session.get_node(node_id).ok_or_else(|| {
        CoreError::NotFound {
            kind: "node",
            id: node_id.to_string(),
        }
        .into()
    })
}

/// Graph lookup that raises on missing.
pub fn get_graph(session: &Arc<Session>, graph_id: &str) -> Result<Arc<Graph>> {
    session.get_graph(graph_id).ok_or_else(|| {
        CoreError::NotFound {
            kind: "graph",
            id: graph_id.to_string(),
        }
        .into()
    })
}

/// Workflow lookup that raises on missing.
pub fn get_workflow(session: &Arc<Session>, workflow_id: &str) -> Result<Arc<Workflow>> {
    session.get_workflow(workflow_id).ok_or_else(|| {
        CoreError::NotFound {
            kind: "workflow",
            id: workflow_id.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_reports_the_key() {
        let params = json!({"node_id": "n"});
        assert_eq!(require_str(&params, "node_id").unwrap(), "n");

        let err = require_str(&params, "graph_id").unwrap_err();
        assert!(err.to_string().contains("graph_id"));
    }

    #[test]
    fn optional_duration_parses_seconds() {
        let params = json!({"timeout": 1.5, "bad": -2.0});
        assert_eq!(
            optional_duration(&params, "timeout"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(optional_duration(&params, "bad"), None);
        assert_eq!(optional_duration(&params, "absent"), None);
    }

    #[test]
    fn optional_str_map_ignores_non_strings() {
        let params = json!({"env": {"A": "1", "B": 2}});
        let map = optional_str_map(&params, "env");
        assert_eq!(map.len(), 1);
        assert_eq!(map["A"], "1");
    }
}
