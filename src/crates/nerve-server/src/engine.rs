//! The engine: dispatcher from wire commands to handler methods.
//!
//! Owns the session registry, the proxy manager and the event sink, and
//! converts handler errors into failed [`CommandResult`]s carrying a
//! human-readable message plus a taxonomy tag in `data.error_type`.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::ServerError;
use crate::handlers::{
    GraphHandler, HistoryHandler, NodeInteractionHandler, NodeLifecycleHandler, SessionHandler,
    WorkflowHandler,
};
use crate::protocols::{Command, CommandResult, CommandType, EventSink};
use crate::proxy::ProxyManager;
use crate::session_registry::SessionRegistry;

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_name: String,
    pub history_enabled: bool,
    pub history_base_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: "nerve".to_string(),
            history_enabled: true,
            history_base_dir: None,
        }
    }
}

/// Server-side command dispatcher.
pub struct Engine {
    registry: Arc<SessionRegistry>,
    proxy_manager: Arc<ProxyManager>,
    session_handler: SessionHandler,
    node_lifecycle: NodeLifecycleHandler,
    node_interaction: NodeInteractionHandler,
    graph_handler: GraphHandler,
    workflow_handler: WorkflowHandler,
    history_handler: HistoryHandler,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Build an engine wired to `sink`.
    pub fn new(sink: Arc<dyn EventSink>, config: EngineConfig) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(
            &config.server_name,
            config.history_enabled,
            config.history_base_dir.clone(),
        ));
        let proxy_manager = Arc::new(ProxyManager::default());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            session_handler: SessionHandler::new(registry.clone(), sink.clone()),
            node_lifecycle: NodeLifecycleHandler::new(
                registry.clone(),
                sink.clone(),
                proxy_manager.clone(),
            ),
            node_interaction: NodeInteractionHandler::new(registry.clone()),
            graph_handler: GraphHandler::new(registry.clone(), sink.clone()),
            workflow_handler: WorkflowHandler::new(registry.clone(), sink),
            history_handler: HistoryHandler::new(registry.clone()),
            registry,
            proxy_manager,
            shutdown_tx,
        })
    }

    /// The session registry (for embedding and tests).
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether a cooperative shutdown has been requested.
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Watch channel that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Execute one command, never panicking outward.
    pub async fn execute(&self, command: Command) -> CommandResult {
        let request_id = command.request_id.clone();
        debug!(command = ?command.command_type, "dispatching command");

        match self.dispatch(command).await {
            Ok(data) => CommandResult::ok(data, request_id),
            Err(e) => CommandResult::err(
                e.to_string(),
                Some(json!({"error_type": e.error_type()})),
                request_id,
            ),
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Value, ServerError> {
        let params = &command.params;
        match command.command_type {
            CommandType::CreateSession => self.session_handler.create_session(params).await,
            CommandType::DeleteSession => self.session_handler.delete_session(params).await,
            CommandType::ListSessions => self.session_handler.list_sessions(params).await,
            CommandType::GetSession => self.session_handler.get_session(params).await,

            CommandType::CreateNode => self.node_lifecycle.create_node(params).await,
            CommandType::DeleteNode => self.node_lifecycle.delete_node(params).await,
            CommandType::ListNodes => self.node_lifecycle.list_nodes(params).await,
            CommandType::GetNode => self.node_lifecycle.get_node_info(params).await,
            CommandType::InterruptNode => self.node_lifecycle.interrupt_node(params).await,

            CommandType::ExecuteInput => self.node_interaction.execute_input(params).await,
            CommandType::WriteRaw => self.node_interaction.write_raw(params).await,
            CommandType::RunCommand => self.node_interaction.run_command(params).await,
            CommandType::ReadBuffer => self.node_interaction.read_buffer(params).await,
            CommandType::ReadTail => self.node_interaction.read_tail(params).await,

            CommandType::CreateGraph => self.graph_handler.create_graph(params).await,
            CommandType::DeleteGraph => self.graph_handler.delete_graph(params).await,
            CommandType::ListGraphs => self.graph_handler.list_graphs(params).await,
            CommandType::GetGraph => self.graph_handler.get_graph_info(params).await,
            CommandType::ExecuteGraph => self.graph_handler.execute_graph(params).await,
            CommandType::RunGraph => self.graph_handler.run_graph(params).await,
            CommandType::CancelGraph => self.graph_handler.cancel_graph(params).await,

            CommandType::RegisterWorkflow => self.workflow_handler.register_workflow(params).await,
            CommandType::ListWorkflows => self.workflow_handler.list_workflows(params).await,
            CommandType::GetWorkflow => self.workflow_handler.get_workflow_info(params).await,
            CommandType::RunWorkflow => self.workflow_handler.run_workflow(params).await,
            CommandType::AnswerGate => self.workflow_handler.answer_gate(params).await,
            CommandType::CancelWorkflow => self.workflow_handler.cancel_workflow(params).await,

            CommandType::GetHistory => self.history_handler.get_history(params).await,

            CommandType::Shutdown => {
                info!("shutdown requested");
                let _ = self.shutdown_tx.send(true);
                Ok(json!({"shutting_down": true}))
            }
        }
    }

    /// Release everything: running graphs, monitors, sessions, proxies.
    /// Called by the transport after the serve loop ends.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.graph_handler.cancel_all();
        self.node_lifecycle.abort_all_monitors();

        for session in self.registry.all() {
            session.stop().await;
        }
        self.proxy_manager.stop_all().await;
    }
}
