//! Session: a named workspace owning nodes, graphs and workflows.
//!
//! A session enforces one id namespace across all three entity kinds - a
//! name used by a node may not be reused by a graph or workflow. Workflow
//! runs register here (weakly) so gates can be answered by run id from any
//! client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::graph::Graph;
use crate::history::HistoryWriter;
use crate::node::Node;
use crate::validation::validate_name;
use crate::workflow::{Workflow, WorkflowRun};

/// Named workspace holding nodes, graphs and workflows.
pub struct Session {
    /// Identifier, also used as the display name.
    pub id: String,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Server this session belongs to (history path segment).
    pub server_name: String,
    /// Whether nodes created here record history.
    pub history_enabled: bool,
    /// Base directory for history files; `None` uses the default.
    pub history_base_dir: RwLock<Option<PathBuf>>,

    nodes: RwLock<HashMap<String, Arc<dyn Node>>>,
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    runs: RwLock<HashMap<String, Weak<WorkflowRun>>>,
}

impl Session {
    /// Create a session with defaults. History is off; servers enable it
    /// through [`Session::with_options`] with their configured base dir.
    pub fn new(id: &str, server_name: &str) -> Arc<Self> {
        Self::with_options(id, server_name, "", Vec::new(), false, None)
            .expect("valid session id")
    }

    /// Create a session with explicit options.
    pub fn with_options(
        id: &str,
        server_name: &str,
        description: &str,
        tags: Vec<String>,
        history_enabled: bool,
        history_base_dir: Option<PathBuf>,
    ) -> Result<Arc<Self>> {
        validate_name(id, "session")?;
        Ok(Arc::new(Self {
            id: id.to_string(),
            description: description.to_string(),
            tags,
            created_at: Utc::now(),
            server_name: server_name.to_string(),
            history_enabled,
            history_base_dir: RwLock::new(history_base_dir),
            nodes: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }))
    }

    /// The kind currently using `id`, if any.
    fn kind_of(&self, id: &str) -> Option<&'static str> {
        if self.nodes.read().contains_key(id) {
            Some("node")
        } else if self.graphs.read().contains_key(id) {
            Some("graph")
        } else if self.workflows.read().contains_key(id) {
            Some("workflow")
        } else {
            None
        }
    }

    fn check_unique(&self, id: &str, kind: &'static str) -> Result<()> {
        validate_name(id, kind)?;
        if let Some(existing) = self.kind_of(id) {
            return Err(CoreError::DuplicateId {
                id: id.to_string(),
                kind: existing,
                session: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Register a node. Fails on invalid or colliding id.
    pub fn register_node(&self, node: Arc<dyn Node>) -> Result<()> {
        let id = node.id().to_string();
        self.check_unique(&id, "node")?;
        debug!(session = %self.id, node_id = %id, node_type = node.node_type(), "node registered");
        self.nodes.write().insert(id, node);
        Ok(())
    }

    /// Register a graph. Fails on invalid or colliding id.
    pub fn register_graph(&self, graph: Arc<Graph>) -> Result<()> {
        let id = graph.id().to_string();
        self.check_unique(&id, "graph")?;
        self.graphs.write().insert(id, graph);
        Ok(())
    }

    /// Register a workflow. Fails on invalid or colliding id.
    pub fn register_workflow(&self, workflow: Arc<Workflow>) -> Result<()> {
        let id = workflow.id().to_string();
        self.check_unique(&id, "workflow")?;
        self.workflows.write().insert(id, workflow);
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<Arc<dyn Node>> {
        self.nodes.read().get(id).cloned()
    }

    pub fn get_graph(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs.read().get(id).cloned()
    }

    pub fn get_workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().get(id).cloned()
    }

    pub fn list_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_graphs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graphs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop and remove a node. Returns false when absent.
    pub async fn delete_node(&self, id: &str) -> bool {
        let node = self.nodes.write().remove(id);
        match node {
            Some(node) => {
                node.stop().await;
                true
            }
            None => false,
        }
    }

    /// Remove a graph. Returns false when absent.
    pub fn delete_graph(&self, id: &str) -> bool {
        self.graphs.write().remove(id).is_some()
    }

    /// Remove a workflow. Returns false when absent.
    pub fn delete_workflow(&self, id: &str) -> bool {
        self.workflows.write().remove(id).is_some()
    }

    /// Track a live workflow run so gates can be answered by run id.
    pub fn register_run(&self, run: &Arc<WorkflowRun>) {
        self.runs
            .write()
            .insert(run.run_id().to_string(), Arc::downgrade(run));
    }

    /// Drop a finished run from the registry.
    pub fn unregister_run(&self, run_id: &str) {
        self.runs.write().remove(run_id);
    }

    /// Look up a live run by id.
    pub fn get_run(&self, run_id: &str) -> Option<Arc<WorkflowRun>> {
        self.runs.read().get(run_id).and_then(Weak::upgrade)
    }

    /// All live runs.
    pub fn list_runs(&self) -> Vec<Arc<WorkflowRun>> {
        self.runs.read().values().filter_map(Weak::upgrade).collect()
    }

    /// History writer for a node, honoring the session's history settings.
    pub fn history_writer_for(&self, node_id: &str) -> Result<Option<Arc<HistoryWriter>>> {
        if !self.history_enabled {
            return Ok(None);
        }
        let base = self.history_base_dir.read().clone();
        let writer = HistoryWriter::create(
            node_id,
            &self.server_name,
            &self.id,
            base.as_deref(),
            true,
        )?;
        Ok(Some(Arc::new(writer)))
    }

    /// Stop every persistent node concurrently and clear the registries.
    /// Stop errors are logged, never raised.
    pub async fn stop(&self) {
        let nodes: Vec<Arc<dyn Node>> = self.nodes.read().values().cloned().collect();
        let persistent: Vec<_> = nodes.into_iter().filter(|n| n.persistent()).collect();

        if !persistent.is_empty() {
            debug!(session = %self.id, count = persistent.len(), "stopping persistent nodes");
            futures::future::join_all(persistent.iter().map(|node| {
                let node = Arc::clone(node);
                async move {
                    node.stop().await;
                }
            }))
            .await;
        }

        self.nodes.write().clear();
        self.graphs.write().clear();
        self.workflows.write().clear();
        let leaked: Vec<String> = self.runs.write().drain().map(|(id, _)| id).collect();
        if !leaked.is_empty() {
            warn!(session = %self.id, runs = leaked.len(), "cleared live workflow runs at shutdown");
        }
    }

    /// Serializable summary.
    pub fn to_info(&self) -> Value {
        json!({
            "id": self.id,
            "description": self.description,
            "tags": self.tags,
            "created_at": self.created_at.to_rfc3339(),
            "server_name": self.server_name,
            "node_count": self.nodes.read().len(),
            "graph_count": self.graphs.read().len(),
            "workflow_count": self.workflows.read().len(),
        })
    }
}
