//! Terminal backends.
//!
//! A backend owns one terminal surface: either a child process attached to
//! a native pseudo-terminal ([`PtyBackend`]) or an existing WezTerm pane
//! driven through the multiplexer CLI ([`WezTermBackend`]). Both expose the
//! same contract: a write channel and a continuously accumulating output
//! buffer that callers snapshot but never truncate.

mod backend;
mod wezterm;

pub use backend::PtyBackend;
pub use wezterm::WezTermBackend;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

/// Configuration for spawning a terminal backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Terminal rows.
    pub rows: u16,
    /// Terminal columns.
    pub cols: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
            rows: 40,
            cols: 120,
        }
    }
}

/// Common interface over terminal backends.
///
/// The buffer is grow-only for the life of the backend; `read_tail` and
/// `buffer_from` exist so callers can avoid copying the whole buffer.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Backend type tag (`"pty"` or `"wezterm"`).
    fn backend_type(&self) -> &'static str;

    /// Write raw data to the terminal.
    async fn write(&self, data: &str) -> Result<()>;

    /// Snapshot of the full accumulated buffer.
    fn buffer(&self) -> String;

    /// Current buffer length in bytes.
    fn buffer_len(&self) -> usize;

    /// Buffer contents from a byte offset (clamped to a char boundary).
    fn buffer_from(&self, start: usize) -> String;

    /// Last `lines` lines of the buffer.
    fn read_tail(&self, lines: usize) -> String;

    /// Whether the child process / pane is still alive.
    fn is_alive(&self) -> bool;

    /// Stop the backend and release its resources. Idempotent.
    async fn stop(&self);
}

pub(crate) fn tail_of(buffer: &str, lines: usize) -> String {
    let all: Vec<&str> = buffer.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

pub(crate) fn slice_from(buffer: &str, start: usize) -> String {
    if start >= buffer.len() {
        return String::new();
    }
    // Clamp to the nearest char boundary at or after `start`.
    let mut idx = start;
    while idx < buffer.len() && !buffer.is_char_boundary(idx) {
        idx += 1;
    }
    buffer[idx..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_of_returns_suffix() {
        let buf = "a\nb\nc\nd";
        assert_eq!(tail_of(buf, 2), "c\nd");
        assert_eq!(tail_of(buf, 10), buf);
    }

    #[test]
    fn slice_from_respects_char_boundaries() {
        let buf = "ab✦cd";
        assert_eq!(slice_from(buf, 0), buf);
        // Index 3 falls inside the 3-byte '✦'; clamp forward to "cd".
        assert_eq!(slice_from(buf, 3), "cd");
        assert_eq!(slice_from(buf, 100), "");
    }
}
