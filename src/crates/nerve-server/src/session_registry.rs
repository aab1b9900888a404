//! Session registry: session id → session, with a default fallback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use nerve_core::{CoreError, Session};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::Result;

/// Id of the session commands target when no `session_id` is given.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Maps session ids to sessions; owns the server-wide default session.
pub struct SessionRegistry {
    server_name: String,
    history_enabled: bool,
    history_base_dir: Option<PathBuf>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create a registry with its default session in place.
    pub fn new(
        server_name: &str,
        history_enabled: bool,
        history_base_dir: Option<PathBuf>,
    ) -> Self {
        let registry = Self {
            server_name: server_name.to_string(),
            history_enabled,
            history_base_dir,
            sessions: RwLock::new(HashMap::new()),
        };
        let default = registry
            .build_session(DEFAULT_SESSION_ID, "", Vec::new())
            .expect("default session id is valid");
        registry
            .sessions
            .write()
            .insert(DEFAULT_SESSION_ID.to_string(), default);
        registry
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn build_session(&self, id: &str, description: &str, tags: Vec<String>) -> Result<Arc<Session>> {
        Ok(Session::with_options(
            id,
            &self.server_name,
            description,
            tags,
            self.history_enabled,
            self.history_base_dir.clone(),
        )?)
    }

    /// Resolve a session; `None` targets the default session.
    pub fn get(&self, session_id: Option<&str>) -> Result<Arc<Session>> {
        let id = session_id.unwrap_or(DEFAULT_SESSION_ID);
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound {
                    kind: "session",
                    id: id.to_string(),
                }
                .into()
            })
    }

    /// The default session.
    pub fn default_session(&self) -> Arc<Session> {
        self.get(None).expect("default session always exists")
    }

    /// Create a new session.
    pub fn create(&self, id: &str, description: &str, tags: Vec<String>) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(id) {
            return Err(CoreError::DuplicateId {
                id: id.to_string(),
                kind: "session",
                session: id.to_string(),
            }
            .into());
        }
        let session = self.build_session(id, description, tags)?;
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    /// Remove a session (the default session cannot be removed).
    pub fn remove(&self, id: &str) -> Result<Arc<Session>> {
        if id == DEFAULT_SESSION_ID {
            return Err(crate::error::ServerError::InvalidParams(
                "the default session cannot be deleted".into(),
            ));
        }
        self.sessions.write().remove(id).ok_or_else(|| {
            CoreError::NotFound {
                kind: "session",
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Info snapshots of every session.
    pub fn list(&self) -> Vec<Value> {
        let mut infos: Vec<(String, Value)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, session)| (id.clone(), session.to_info()))
            .collect();
        infos.sort_by(|(a, _), (b, _)| a.cmp(b));
        infos.into_iter().map(|(_, info)| info).collect()
    }

    /// All sessions (for shutdown sweeps).
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_exists() {
        let registry = SessionRegistry::new("srv", false, None);
        assert_eq!(registry.default_session().id, "default");
        assert!(registry.get(None).is_ok());
        assert!(registry.get(Some("default")).is_ok());
    }

    #[test]
    fn create_get_remove() {
        let registry = SessionRegistry::new("srv", false, None);
        registry.create("work", "desc", vec!["t".into()]).unwrap();

        assert_eq!(registry.get(Some("work")).unwrap().id, "work");
        assert!(registry.create("work", "", vec![]).is_err());
        assert_eq!(registry.list().len(), 2);

        registry.remove("work").unwrap();
        assert!(registry.get(Some("work")).is_err());
    }

    #[test]
    fn default_session_cannot_be_removed() {
        let registry = SessionRegistry::new("srv", false, None);
        assert!(registry.remove("default").is_err());
    }
}
