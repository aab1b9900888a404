//! Socket client with concurrent request multiplexing.
//!
//! The client never assumes request/response pairs interleave strictly: a
//! background reader routes each incoming `result` to the completion slot
//! registered under its `request_id`, and everything else to the event
//! queue. Request ids are auto-generated UUIDs when absent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nerve_server::protocols::Event;
use nerve_server::{Command, CommandResult, CommandType};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Result, TransportError, MAX_LINE_BYTES};

/// Default bound on one command round-trip.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<CommandResult>>>>;

/// Client over a Unix or TCP stream.
pub struct SocketClient {
    out_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    connected: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl SocketClient {
    /// Connect over a Unix domain socket.
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "connected over unix socket");
        Ok(Self::start(stream))
    }

    /// Connect over TCP.
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        debug!(host, port, "connected over tcp");
        Ok(Self::start(stream))
    }

    fn start<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let (mut write_half, mut read_half) = framed.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if write_half.send(line).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            while let Some(line) = read_half.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "framing error from server");
                        break;
                    }
                };
                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "unparseable line from server");
                        continue;
                    }
                };

                if message.get("type").and_then(Value::as_str) == Some("result") {
                    let request_id = message
                        .get("request_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let slot = request_id
                        .as_ref()
                        .and_then(|id| reader_pending.lock().remove(id));
                    match slot {
                        Some(slot) => {
                            let result = CommandResult {
                                success: message
                                    .get("success")
                                    .and_then(Value::as_bool)
                                    .unwrap_or(false),
                                data: message.get("data").cloned(),
                                error: message
                                    .get("error")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                request_id,
                            };
                            let _ = slot.send(result);
                        }
                        None => {
                            // A response for a request we stopped waiting on
                            // (e.g. after a client-side timeout).
                            debug!(request_id = ?request_id, "response for unknown request");
                        }
                    }
                } else if message.get("type").and_then(Value::as_str) == Some("event") {
                    let event = Event {
                        event_type: message
                            .get("event_type")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        node_id: message
                            .get("node_id")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        data: message.get("data").cloned().unwrap_or(Value::Null),
                        timestamp: message
                            .get("timestamp")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                    };
                    let _ = event_tx.send(event);
                } else {
                    warn!(line = %line, "unexpected message from server");
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            debug!("client read loop ended");
        });

        Self {
            out_tx,
            pending,
            events: Mutex::new(Some(event_rx)),
            connected,
            reader,
            writer,
        }
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its result, matched by `request_id`.
    /// Concurrent calls are safe; responses may arrive in any order.
    pub async fn send_command(&self, command: Command) -> Result<CommandResult> {
        self.send_command_with_timeout(command, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// [`send_command`](Self::send_command) with an explicit timeout.
    pub async fn send_command_with_timeout(
        &self,
        mut command: Command,
        timeout: Duration,
    ) -> Result<CommandResult> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let request_id = command
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let line = json!({
            "type": "command",
            "command_type": command.command_type,
            "params": command.params,
            "request_id": request_id,
        })
        .to_string();

        if self.out_tx.send(line).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(TransportError::ConnectionClosed)
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(TransportError::Timeout(timeout.as_secs_f64()))
            }
        }
    }

    /// Take the event stream. Yields every broadcast event in the order the
    /// server sent them. Can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.events.lock().take()
    }

    /// Disconnect and stop the background tasks.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
    }
}

/// Typed conveniences over the raw command interface.
impl SocketClient {
    async fn expect_data(&self, command: Command) -> Result<Value> {
        let result = self.send_command(command).await?;
        if result.success {
            Ok(result.data.unwrap_or(Value::Null))
        } else {
            Err(TransportError::Command(
                result.error.unwrap_or_else(|| "command failed".into()),
            ))
        }
    }

    /// Create a node; `node_type` is `pty`, `wezterm`, `bash`, `llm` or `mcp`.
    pub async fn create_node(&self, node_id: &str, node_type: &str, params: Value) -> Result<Value> {
        let mut merged = params;
        if let Value::Object(map) = &mut merged {
            map.insert("node_id".into(), json!(node_id));
            map.insert("node_type".into(), json!(node_type));
        } else {
            merged = json!({"node_id": node_id, "node_type": node_type});
        }
        self.expect_data(Command::new(CommandType::CreateNode, merged))
            .await
    }

    /// Send input to a node and wait for its parsed response.
    pub async fn execute_input(&self, node_id: &str, text: &str, parser: Option<&str>) -> Result<Value> {
        self.expect_data(Command::new(
            CommandType::ExecuteInput,
            json!({"node_id": node_id, "text": text, "parser": parser}),
        ))
        .await
        .map(|data| data.get("response").cloned().unwrap_or(Value::Null))
    }

    /// Last `lines` lines of a terminal node's buffer.
    pub async fn read_tail(&self, node_id: &str, lines: usize) -> Result<String> {
        self.expect_data(Command::new(
            CommandType::ReadTail,
            json!({"node_id": node_id, "lines": lines}),
        ))
        .await
        .map(|data| {
            data.get("buffer")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
    }

    /// Delete a node, tearing down its monitor and proxy.
    pub async fn delete_node(&self, node_id: &str) -> Result<Value> {
        self.expect_data(Command::new(
            CommandType::DeleteNode,
            json!({"node_id": node_id}),
        ))
        .await
    }

    /// Node infos for one session (default when `None`).
    pub async fn list_nodes(&self, session_id: Option<&str>) -> Result<Value> {
        self.expect_data(Command::new(
            CommandType::ListNodes,
            json!({"session_id": session_id}),
        ))
        .await
    }

    /// Ask the server to stop cooperatively.
    pub async fn shutdown(&self) -> Result<Value> {
        self.expect_data(Command::new(CommandType::Shutdown, json!({})))
            .await
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
