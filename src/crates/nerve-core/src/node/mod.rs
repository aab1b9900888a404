//! Node runtime: executors behind a common interface.
//!
//! A node is a named executor owned by a session. The graph scheduler, the
//! workflow runtime and the engine only ever see the [`Node`] trait;
//! concrete kinds (terminal, bash, LLM, MCP, function) differ only at
//! construction time.
//!
//! Node results are JSON objects. Every kind sets at least `success` and
//! `output`, so graph template interpolation (`{step_id}` →
//! `upstream[step_id]["output"]`) works uniformly.

pub mod bash;
pub mod function;
pub mod llm;
pub mod mcp;
pub mod terminal;

pub use bash::BashNode;
pub use function::FunctionNode;
pub use llm::{LlmConfig, LlmNode};
pub use mcp::McpNode;
pub use terminal::TerminalNode;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::history::HistoryWriter;
use crate::parser::ParserKind;
use crate::session::Session;

/// Lifecycle state of a node.
///
/// Created → Starting → Ready ⇌ Busy; any state → Stopped on shutdown; any
/// operation → Error on a fatal fault. Only Ready and Busy are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Created,
    Starting,
    Ready,
    Busy,
    Stopped,
    Error,
}

impl NodeState {
    pub fn is_live(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Ready => "ready",
            NodeState::Busy => "busy",
            NodeState::Stopped => "stopped",
            NodeState::Error => "error",
        }
    }
}

/// Snapshot of a node for listing.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub node_type: String,
    pub state: NodeState,
    pub persistent: bool,
    pub metadata: Value,
}

/// Per-call bundle passed into every `execute`. Immutable within one call.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Session the call executes in.
    pub session: Arc<Session>,
    /// Input understood by the node (command string, messages, ...).
    pub input: Value,
    /// Optional per-call timeout.
    pub timeout: Option<Duration>,
    /// Optional parser override for terminal nodes.
    pub parser: Option<ParserKind>,
    /// Results of upstream graph steps, keyed by step id.
    pub upstream: Arc<HashMap<String, Value>>,
    /// Correlation id for logging.
    pub exec_id: String,
}

impl ExecutionContext {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            input: Value::Null,
            timeout: None,
            parser: None,
            upstream: Arc::new(HashMap::new()),
            exec_id: Uuid::new_v4().to_string()[..8].to_string(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parser(mut self, parser: Option<ParserKind>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_upstream(mut self, upstream: HashMap<String, Value>) -> Self {
        self.upstream = Arc::new(upstream);
        self
    }

    /// Input coerced to a string (JSON strings unquoted).
    pub fn input_str(&self) -> String {
        match &self.input {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Common interface over all node kinds.
#[async_trait]
pub trait Node: Send + Sync {
    /// Node identifier, unique within its session.
    fn id(&self) -> &str;

    /// Kind tag (`"terminal"`, `"bash"`, `"llm"`, `"mcp"`, `"function"`,
    /// `"graph"`).
    fn node_type(&self) -> &'static str;

    /// Current lifecycle state.
    fn state(&self) -> NodeState;

    /// Whether the node owns long-lived resources.
    fn persistent(&self) -> bool {
        false
    }

    /// Execute one call. Serialized per node: state must be Ready on entry
    /// and returns to Ready on success; concurrent callers observe Busy.
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value>;

    /// Release resources and transition to Stopped. Idempotent.
    async fn stop(&self);

    /// Best-effort cancel of an in-flight operation.
    async fn interrupt(&self) {}

    /// Snapshot for listing.
    fn to_info(&self) -> NodeInfo;

    /// History writer, for node kinds that log operations.
    fn history_writer(&self) -> Option<Arc<HistoryWriter>> {
        None
    }

    /// Full buffer snapshot (terminal nodes only).
    async fn read(&self) -> Result<String> {
        Err(CoreError::Execution(format!(
            "node '{}' does not expose a buffer",
            self.id()
        )))
    }

    /// Last `lines` lines of the buffer (terminal nodes only).
    async fn read_tail(&self, _lines: usize) -> Result<String> {
        Err(CoreError::Execution(format!(
            "node '{}' does not expose a buffer",
            self.id()
        )))
    }

    /// Raw write to the node's input channel (terminal nodes only).
    async fn write(&self, _data: &str) -> Result<()> {
        Err(CoreError::Execution(format!(
            "node '{}' does not accept raw writes",
            self.id()
        )))
    }

    /// Fire-and-forget program start (terminal nodes only).
    async fn run(&self, _command: &str) -> Result<()> {
        Err(CoreError::Execution(format!(
            "node '{}' does not run programs",
            self.id()
        )))
    }
}

/// Reject execution unless the node can accept a call right now.
pub(crate) fn check_executable(id: &str, state: NodeState, error_message: Option<&str>) -> Result<()> {
    match state {
        NodeState::Stopped => Err(CoreError::NodeStopped(id.to_string())),
        NodeState::Error => Err(CoreError::NodeError {
            id: id.to_string(),
            message: error_message.unwrap_or("unknown fault").to_string(),
        }),
        NodeState::Busy => Err(CoreError::NodeBusy(id.to_string())),
        _ => Ok(()),
    }
}
