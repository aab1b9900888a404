//! Workflow run events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// One entry in a run's append-only event log.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    pub run_id: String,
    pub workflow_id: String,
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(run_id: &str, workflow_id: &str, event_type: &str, data: Value) -> Self {
        Self {
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "workflow_id": self.workflow_id,
            "event_type": self.event_type,
            "data": self.data,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}
