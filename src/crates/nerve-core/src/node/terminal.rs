//! Persistent terminal node.
//!
//! Owns a terminal backend (native PTY or WezTerm pane) whose buffer grows
//! without bound for the life of the node. `send` records the buffer length
//! before writing, submits the input, then polls the per-call parser on the
//! suffix after that mark until it reports ready on two consecutive polls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{check_executable, ExecutionContext, Node, NodeInfo, NodeState};
use crate::error::{CoreError, Result};
use crate::history::{HistoryWriter, HISTORY_BUFFER_LINES};
use crate::parser::{get_parser, ParsedResponse, ParserKind};
use crate::pty::{BackendConfig, PtyBackend, TerminalBackend, WezTermBackend};
use crate::session::Session;

/// Readiness poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Consecutive ready polls required before trusting the parser (debounce).
const CONSECUTIVE_READY: u32 = 2;
/// Settle delay after readiness before flipping back to Ready.
const POST_READY_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for the CLI to visibly start processing.
const PROCESSING_START_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on one response.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Options for creating terminal nodes.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub ready_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
            ready_timeout: Duration::from_secs(60),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Persistent node around a terminal backend.
pub struct TerminalNode {
    id: String,
    backend: Arc<dyn TerminalBackend>,
    command: Option<String>,
    state: Mutex<NodeState>,
    response_timeout: Duration,
    history: Option<Arc<HistoryWriter>>,
    last_input: Mutex<String>,
}

impl TerminalNode {
    /// Spawn `command` in a fresh PTY and register the node.
    pub async fn create_pty(
        id: &str,
        session: &Arc<Session>,
        command: Option<&str>,
        options: TerminalOptions,
    ) -> Result<Arc<Self>> {
        let command_str = command.unwrap_or("bash").to_string();
        let argv: Vec<String> = command_str.split_whitespace().map(str::to_string).collect();

        let backend = PtyBackend::spawn(
            &argv,
            &BackendConfig {
                cwd: options.cwd.clone(),
                env: options.env.clone(),
                ..BackendConfig::default()
            },
        )?;

        Self::finish_create(id, session, Arc::new(backend), Some(command_str), options).await
    }

    /// Spawn `command` in a new WezTerm pane and register the node.
    pub async fn create_wezterm(
        id: &str,
        session: &Arc<Session>,
        command: Option<&str>,
        options: TerminalOptions,
    ) -> Result<Arc<Self>> {
        let command_str = command.unwrap_or("bash").to_string();
        let argv: Vec<String> = command_str.split_whitespace().map(str::to_string).collect();

        let backend = WezTermBackend::spawn(
            &argv,
            &BackendConfig {
                cwd: options.cwd.clone(),
                env: options.env.clone(),
                ..BackendConfig::default()
            },
        )
        .await?;

        Self::finish_create(id, session, Arc::new(backend), Some(command_str), options).await
    }

    /// Attach to an existing WezTerm pane and register the node.
    pub async fn attach_wezterm(
        id: &str,
        session: &Arc<Session>,
        pane_id: &str,
        options: TerminalOptions,
    ) -> Result<Arc<Self>> {
        let backend = WezTermBackend::attach(pane_id).await?;
        Self::finish_create(id, session, Arc::new(backend), None, options).await
    }

    async fn finish_create(
        id: &str,
        session: &Arc<Session>,
        backend: Arc<dyn TerminalBackend>,
        command: Option<String>,
        options: TerminalOptions,
    ) -> Result<Arc<Self>> {
        let history = session.history_writer_for(id)?;

        let node = Arc::new(Self {
            id: id.to_string(),
            backend,
            command,
            state: Mutex::new(NodeState::Starting),
            response_timeout: options.response_timeout,
            history,
            last_input: Mutex::new(String::new()),
        });

        if let Err(e) = session.register_node(node.clone()) {
            // Do not leak the child behind a node that never existed.
            node.backend.stop().await;
            return Err(e);
        }

        // Give the program a moment to draw its first prompt.
        sleep(Duration::from_millis(500)).await;
        *node.state.lock() = NodeState::Ready;
        Ok(node)
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    /// Transition Ready → Busy, rejecting calls in any other state.
    fn begin_busy(&self) -> Result<()> {
        let mut state = self.state.lock();
        check_executable(&self.id, *state, None)?;
        if *state != NodeState::Ready {
            return Err(CoreError::Execution(format!(
                "node '{}' is not ready (state: {})",
                self.id,
                state.as_str()
            )));
        }
        *state = NodeState::Busy;
        Ok(())
    }

    /// Capture the deferred buffer snapshot owed after a fire-and-forget
    /// operation, returning its sequence number for `preceding_buffer_seq`.
    fn capture_pending_buffer(&self) -> Option<u64> {
        let history = self.history.as_ref()?;
        if !history.needs_buffer_capture() {
            return None;
        }
        let tail = self.backend.read_tail(HISTORY_BUFFER_LINES);
        let seq = history.log_read(&tail, HISTORY_BUFFER_LINES);
        (seq > 0).then_some(seq)
    }

    /// Send input and wait for the parsed response.
    pub async fn send(
        &self,
        input: &str,
        parser: ParserKind,
        timeout: Option<Duration>,
        submit: Option<&str>,
    ) -> Result<ParsedResponse> {
        self.begin_busy()?;

        let result = self.send_inner(input, parser, timeout, submit).await;
        match &result {
            Ok(_) => self.set_state(NodeState::Ready),
            // Timeout leaves the node Busy pending a subsequent interrupt.
            Err(CoreError::Timeout(_)) => {}
            Err(_) => self.set_state(NodeState::Ready),
        }
        result
    }

    async fn send_inner(
        &self,
        input: &str,
        parser: ParserKind,
        timeout: Option<Duration>,
        submit: Option<&str>,
    ) -> Result<ParsedResponse> {
        *self.last_input.lock() = input.to_string();

        let ts_start = Utc::now();
        let preceding_buffer_seq = self.capture_pending_buffer();

        let timeout = timeout.unwrap_or(self.response_timeout);
        let parser_instance = get_parser(parser);

        // Mark the buffer position before sending; only the suffix after
        // this point is parsed.
        let buffer_start = self.backend.buffer_len();

        let claude_flow = parser == ParserKind::Claude && submit.is_none();
        if claude_flow {
            // Claude's editor needs insert mode and an explicit Esc+Enter.
            self.backend.write("i").await?;
            sleep(Duration::from_millis(200)).await;
            self.backend.write(input).await?;
            sleep(Duration::from_millis(500)).await;
            self.backend.write("\x1b").await?;
            sleep(Duration::from_millis(500)).await;
            self.backend.write("\r").await?;
        } else {
            self.backend.write(input).await?;
            sleep(Duration::from_millis(100)).await;
            self.backend.write(submit.unwrap_or("\n")).await?;
        }

        self.wait_for_ready(&*parser_instance, parser, buffer_start, timeout)
            .await?;

        let new_output = self.backend.buffer_from(buffer_start);
        let response = parser_instance.parse(&new_output);

        if let Some(history) = &self.history {
            let response_value = serde_json::to_value(&response).unwrap_or(Value::Null);
            history.log_send(input, response_value, preceding_buffer_seq, ts_start);
        }

        Ok(response)
    }

    async fn wait_for_ready(
        &self,
        parser: &dyn crate::parser::Parser,
        kind: ParserKind,
        buffer_start: usize,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        // For Claude, wait until the CLI visibly starts processing so a
        // stale prompt is not mistaken for readiness.
        if kind == ParserKind::Claude {
            let start_deadline = tokio::time::Instant::now() + PROCESSING_START_TIMEOUT;
            while tokio::time::Instant::now() < start_deadline {
                let window = self.backend.buffer_from(buffer_start).to_lowercase();
                if window.contains("esc to interrupt") || window.contains("esc to cancel") {
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        let mut ready_count = 0u32;
        while tokio::time::Instant::now() < deadline {
            let window = self.backend.buffer_from(buffer_start);
            if parser.is_ready(&window) {
                ready_count += 1;
                if ready_count >= CONSECUTIVE_READY {
                    sleep(POST_READY_GRACE).await;
                    return Ok(());
                }
            } else {
                ready_count = 0;
            }
            sleep(POLL_INTERVAL).await;
        }

        warn!(node_id = %self.id, timeout_s = timeout.as_secs_f64(), "terminal response timed out");
        Err(CoreError::Timeout(timeout.as_secs_f64()))
    }

    /// Send input and stream output chunks until the parser reports ready.
    ///
    /// History logs the final buffer tail after streaming completes, not the
    /// individual chunks.
    pub fn send_stream(
        self: &Arc<Self>,
        input: String,
        parser: ParserKind,
    ) -> impl Stream<Item = String> {
        let node = Arc::clone(self);
        async_stream::stream! {
            if node.begin_busy().is_err() {
                return;
            }
            let ts_start = Utc::now();
            let preceding_buffer_seq = node.capture_pending_buffer();
            let parser_instance = get_parser(parser);

            let buffer_start = node.backend.buffer_len();
            if node.backend.write(&format!("{input}\n")).await.is_err() {
                node.set_state(NodeState::Ready);
                return;
            }

            let mut cursor = buffer_start;
            loop {
                sleep(Duration::from_millis(100)).await;
                let len = node.backend.buffer_len();
                if len > cursor {
                    let chunk = node.backend.buffer_from(cursor);
                    cursor = len;
                    yield chunk;
                }

                let window = node.backend.buffer_from(buffer_start);
                if parser_instance.is_ready(&window) {
                    break;
                }
                if !node.backend.is_alive() {
                    break;
                }
            }

            node.set_state(NodeState::Ready);
            if let Some(history) = &node.history {
                let tail = node.backend.read_tail(HISTORY_BUFFER_LINES);
                history.log_send_stream(
                    &input,
                    &tail,
                    parser.as_str(),
                    preceding_buffer_seq,
                    ts_start,
                );
            }
        }
    }

    /// Buffer length right now; useful to bracket externally driven writes.
    pub fn buffer_len(&self) -> usize {
        self.backend.buffer_len()
    }
}

#[async_trait]
impl Node for TerminalNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "terminal"
    }

    fn state(&self) -> NodeState {
        *self.state.lock()
    }

    fn persistent(&self) -> bool {
        true
    }

    /// Execute input text as a `send` and return the parsed response as a
    /// JSON object with uniform `success`/`output` fields.
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        let input = ctx.input_str();
        let parser = ctx.parser.unwrap_or(ParserKind::None);
        let response = self.send(&input, parser, ctx.timeout, None).await?;

        let mut value = serde_json::to_value(&response)?;
        if let Value::Object(map) = &mut value {
            map.insert("success".into(), json!(true));
            map.insert("output".into(), json!(response.raw));
        }
        Ok(value)
    }

    async fn stop(&self) {
        if let Some(history) = &self.history {
            history.log_delete(None);
            history.close();
        }
        self.backend.stop().await;
        self.set_state(NodeState::Stopped);
    }

    /// Send Ctrl+C to the foreground program.
    async fn interrupt(&self) {
        if let Err(e) = self.backend.write("\x03").await {
            warn!(node_id = %self.id, error = %e, "interrupt write failed");
        }
        if let Some(history) = &self.history {
            history.log_interrupt();
        }
        // An interrupt aborts any pending response; the node takes input again.
        let mut state = self.state.lock();
        if *state == NodeState::Busy {
            *state = NodeState::Ready;
        }
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: "terminal".into(),
            state: self.state(),
            persistent: true,
            metadata: json!({
                "backend": self.backend.backend_type(),
                "command": self.command,
                "last_input": *self.last_input.lock(),
                "buffer_len": self.backend.buffer_len(),
            }),
        }
    }

    fn history_writer(&self) -> Option<Arc<HistoryWriter>> {
        self.history.clone()
    }

    async fn read(&self) -> Result<String> {
        Ok(self.backend.buffer())
    }

    async fn read_tail(&self, lines: usize) -> Result<String> {
        Ok(self.backend.read_tail(lines))
    }

    /// Raw write; history logs the write and a follow-up buffer snapshot.
    async fn write(&self, data: &str) -> Result<()> {
        self.backend.write(data).await?;
        if let Some(history) = &self.history {
            history.log_write(data);
            sleep(Duration::from_millis(100)).await;
            let tail = self.backend.read_tail(HISTORY_BUFFER_LINES);
            history.log_read(&tail, HISTORY_BUFFER_LINES);
        }
        Ok(())
    }

    /// Start a program in the terminal (fire and forget).
    async fn run(&self, command: &str) -> Result<()> {
        debug!(node_id = %self.id, %command, "terminal_run");
        self.backend.write(&format!("{command}\n")).await?;
        if let Some(history) = &self.history {
            history.log_run(command);
            sleep(Duration::from_millis(500)).await;
            let tail = self.backend.read_tail(HISTORY_BUFFER_LINES);
            history.log_read(&tail, HISTORY_BUFFER_LINES);
        }
        Ok(())
    }
}
