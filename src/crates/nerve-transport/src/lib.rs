//! Socket transport for the nerve daemon.
//!
//! One framing rule on both Unix and TCP sockets: newline-delimited UTF-8
//! JSON objects, with a 16 MiB per-line cap to accommodate buffer
//! snapshots. The server fans engine events out to every connected client;
//! the client multiplexes concurrent requests by `request_id`.

pub mod client;
pub mod server;

pub use client::SocketClient;
pub use server::{ServerAddr, SocketServer};

use thiserror::Error;

/// Maximum length of one framed JSON line.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("request timed out after {0:.1}s")]
    Timeout(f64),

    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with `success=false`.
    #[error("{0}")]
    Command(String),
}
