//! Core runtime for the nerve orchestration daemon.
//!
//! This crate owns the server-side building blocks that the engine and
//! transport layers compose:
//!
//! - **Parsers** ([`parser`]) - pure readiness/section parsers for
//!   interactive AI CLIs (Claude, Gemini).
//! - **Terminal backends** ([`pty`]) - pseudo-terminal and WezTerm pane
//!   backends with continuously accumulating output buffers.
//! - **Nodes** ([`node`]) - executors behind a common interface: terminal,
//!   bash, LLM HTTP client, MCP tool server, in-process function.
//! - **Graphs** ([`graph`]) - declarative DAGs of steps with
//!   dependency-ordered concurrent execution.
//! - **Workflows** ([`workflow`]) - imperative async flows that can pause
//!   at human gates without blocking the process.
//! - **Sessions** ([`session`]) - named workspaces owning nodes, graphs and
//!   workflows with unified id uniqueness.
//! - **History** ([`history`]) - append-only per-node JSONL operation logs.

pub mod error;
pub mod graph;
pub mod history;
pub mod node;
pub mod parser;
pub mod pty;
pub mod session;
pub mod validation;
pub mod workflow;

pub use error::{CoreError, Result};
pub use graph::{Graph, Step, StepEvent};
pub use node::{ExecutionContext, Node, NodeInfo, NodeState};
pub use parser::{ParsedResponse, Parser, ParserKind, Section, SectionKind};
pub use session::Session;
pub use workflow::{Workflow, WorkflowContext, WorkflowRun, WorkflowState};
