//! Session lifecycle commands.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::Result;
use crate::protocols::{Event, EventSink, EventType};
use crate::session_registry::SessionRegistry;
use crate::validation::{optional_str, require_str};

pub struct SessionHandler {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
}

impl SessionHandler {
    pub fn new(registry: Arc<SessionRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self { registry, sink }
    }

    /// `CREATE_SESSION {session_id, description?, tags?}`
    pub async fn create_session(&self, params: &Value) -> Result<Value> {
        let session_id = require_str(params, "session_id")?;
        let description = optional_str(params, "description").unwrap_or("");
        let tags = params
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let session = self.registry.create(session_id, description, tags)?;
        self.sink
            .emit(Event::new(
                EventType::SessionCreated,
                None,
                json!({"session_id": session_id}),
            ))
            .await;
        Ok(session.to_info())
    }

    /// `DELETE_SESSION {session_id}` - stops every node first.
    pub async fn delete_session(&self, params: &Value) -> Result<Value> {
        let session_id = require_str(params, "session_id")?;
        let session = self.registry.remove(session_id)?;
        session.stop().await;

        self.sink
            .emit(Event::new(
                EventType::SessionDeleted,
                None,
                json!({"session_id": session_id}),
            ))
            .await;
        Ok(json!({"deleted": true, "session_id": session_id}))
    }

    /// `LIST_SESSIONS {}`
    pub async fn list_sessions(&self, _params: &Value) -> Result<Value> {
        Ok(json!({"sessions": self.registry.list()}))
    }

    /// `GET_SESSION {session_id?}`
    pub async fn get_session(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        Ok(session.to_info())
    }
}
