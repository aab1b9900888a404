//! Wire protocol types shared by the engine, transports and clients.
//!
//! Three message shapes cross the socket, each one newline-delimited JSON
//! object: commands from clients, results from the server (echoing the
//! command's `request_id`), and broadcast events.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    // Sessions
    CreateSession,
    DeleteSession,
    ListSessions,
    GetSession,
    // Node lifecycle
    CreateNode,
    DeleteNode,
    ListNodes,
    GetNode,
    InterruptNode,
    // Node interaction
    ExecuteInput,
    WriteRaw,
    RunCommand,
    ReadBuffer,
    ReadTail,
    // Graphs
    CreateGraph,
    DeleteGraph,
    ListGraphs,
    GetGraph,
    ExecuteGraph,
    RunGraph,
    CancelGraph,
    // Workflows
    RegisterWorkflow,
    ListWorkflows,
    GetWorkflow,
    RunWorkflow,
    AnswerGate,
    CancelWorkflow,
    // History
    GetHistory,
    // Server
    Shutdown,
}

/// One command from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_type: CommandType,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Command {
    pub fn new(command_type: CommandType, params: Value) -> Self {
        Self {
            command_type,
            params,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// The server's reply to one command; `request_id` matches the command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl CommandResult {
    pub fn ok(data: Value, request_id: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id,
        }
    }

    pub fn err(error: String, data: Option<Value>, request_id: Option<String>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error),
            request_id,
        }
    }
}

/// Engine-emitted event types. Workflow runs additionally emit their own
/// lowercase event names (and the `nested:<type>` family), which travel as
/// free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SessionCreated,
    SessionDeleted,
    NodeCreated,
    NodeReady,
    NodeBusy,
    NodeStopped,
    NodeDeleted,
    NodeError,
    GraphCreated,
    GraphStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    GraphCompleted,
    GraphDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionCreated => "SESSION_CREATED",
            EventType::SessionDeleted => "SESSION_DELETED",
            EventType::NodeCreated => "NODE_CREATED",
            EventType::NodeReady => "NODE_READY",
            EventType::NodeBusy => "NODE_BUSY",
            EventType::NodeStopped => "NODE_STOPPED",
            EventType::NodeDeleted => "NODE_DELETED",
            EventType::NodeError => "NODE_ERROR",
            EventType::GraphCreated => "GRAPH_CREATED",
            EventType::GraphStarted => "GRAPH_STARTED",
            EventType::StepStarted => "STEP_STARTED",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::StepFailed => "STEP_FAILED",
            EventType::GraphCompleted => "GRAPH_COMPLETED",
            EventType::GraphDeleted => "GRAPH_DELETED",
        }
    }
}

/// One broadcast event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: f64,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Event {
    pub fn new(event_type: EventType, node_id: Option<String>, data: Value) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            node_id,
            data,
            timestamp: now_epoch(),
        }
    }

    /// Event with a free-form type (workflow events, `nested:<type>`).
    pub fn custom(event_type: &str, node_id: Option<String>, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            node_id,
            data,
            timestamp: now_epoch(),
        }
    }
}

/// Where engine events go. The transport server implements this to
/// broadcast to every connected client.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Sink that drops everything; for embedding and tests.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: Event) {}
}
