//! Socket server: accepts clients, dispatches commands concurrently, and
//! broadcasts engine events to every connection.
//!
//! Each connection gets one writer task fed by a channel, so responses and
//! events never interleave mid-line; each incoming command runs in its own
//! task, so a long-running command never blocks other messages from the
//! same client.

use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use nerve_server::protocols::{Event, EventSink};
use nerve_server::{Command, Engine};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::{Result, MAX_LINE_BYTES};

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum ServerAddr {
    /// Unix domain socket at this path.
    Unix(PathBuf),
    /// TCP socket at host:port.
    Tcp(String, u16),
}

/// Event sink that serializes events once and fans them out to every
/// connection's writer task.
struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

#[async_trait::async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: Event) {
        let line = json!({
            "type": "event",
            "event_type": event.event_type,
            "node_id": event.node_id,
            "data": event.data,
            "timestamp": event.timestamp,
        })
        .to_string();
        // No receivers just means no clients are connected.
        let _ = self.tx.send(line);
    }
}

/// Newline-delimited-JSON server over Unix or TCP sockets.
pub struct SocketServer {
    addr: ServerAddr,
    events: broadcast::Sender<String>,
}

impl SocketServer {
    pub fn new(addr: ServerAddr) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { addr, events }
    }

    /// The sink to hand to [`Engine::new`] so events reach all clients.
    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        Arc::new(BroadcastSink {
            tx: self.events.clone(),
        })
    }

    /// Serve until the engine's shutdown signal fires, then tear the
    /// engine down.
    pub async fn serve(&self, engine: Arc<Engine>) -> Result<()> {
        let mut shutdown = engine.shutdown_signal();

        match &self.addr {
            ServerAddr::Unix(path) => {
                // A stale socket file from a previous run blocks the bind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                info!(path = %path.display(), "unix socket server started");

                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (stream, _) = accepted?;
                            self.spawn_connection(stream, engine.clone());
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }

                let _ = std::fs::remove_file(path);
            }
            ServerAddr::Tcp(host, port) => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                info!(host = %host, port, "tcp server started");

                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (stream, addr) = accepted?;
                            debug!(%addr, "client connected");
                            self.spawn_connection(stream, engine.clone());
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("server stopping");
        engine.shutdown().await;
        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S, engine: Arc<Engine>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let events = self.events.subscribe();
        tokio::spawn(handle_connection(stream, engine, events));
    }
}

async fn handle_connection<S>(
    stream: S,
    engine: Arc<Engine>,
    mut events: broadcast::Receiver<String>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let (mut write_half, mut read_half) = framed.split();

    // Single writer per connection: responses and events are serialized
    // through one channel, so lines never interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut events_open = true;
        loop {
            tokio::select! {
                line = out_rx.recv() => {
                    match line {
                        Some(line) => {
                            if write_half.send(line).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(line) => {
                            if write_half.send(line).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "client fell behind on events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events_open = false;
                        }
                    }
                }
            }
        }
    });

    while let Some(line) = read_half.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                // Oversized or malformed frame: report and drop the
                // connection, the codec cannot resynchronize.
                warn!(error = %e, "framing error, closing connection");
                let _ = out_tx.send(
                    json!({"type": "error", "error": format!("framing error: {e}")}).to_string(),
                );
                break;
            }
        };

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "invalid JSON from client");
                let _ = out_tx
                    .send(json!({"type": "error", "error": "Invalid JSON"}).to_string());
                continue;
            }
        };

        if message.get("type").and_then(Value::as_str) != Some("command") {
            let _ = out_tx
                .send(json!({"type": "error", "error": "Unknown message type"}).to_string());
            continue;
        }

        let command: Command = match serde_json::from_value(message) {
            Ok(command) => command,
            Err(e) => {
                let _ = out_tx.send(
                    json!({"type": "error", "error": format!("invalid command: {e}")}).to_string(),
                );
                continue;
            }
        };

        // Dispatch concurrently so one slow command does not block the
        // connection's other messages.
        let task_engine = engine.clone();
        let task_out = out_tx.clone();
        tokio::spawn(async move {
            let result = task_engine.execute(command).await;
            let line = json!({
                "type": "result",
                "success": result.success,
                "data": result.data,
                "error": result.error,
                "request_id": result.request_id,
            })
            .to_string();
            let _ = task_out.send(line);
        });
    }

    debug!("client disconnected");
    drop(out_tx);
    // Writer drains any in-flight responses, then exits on channel close.
    let _ = writer.await;
}
