//! Append-only per-node operation history.
//!
//! Every node may own a [`HistoryWriter`] that records its operations as one
//! JSON object per line at `<base>/<server>/<session>/<node>.jsonl`. Entries
//! carry a dense, strictly increasing `seq` recovered from the file on
//! reopen, so a restarted daemon continues the numbering.
//!
//! Error policy is fail-soft: only [`HistoryWriter::create`] may fail
//! loudly. Per-operation writes log a warning and return 0 - a debugging log
//! that breaks the daemon is worse than a missing line.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::validation::validate_name;

/// Number of buffer lines captured for `read` / `send_stream` entries.
pub const HISTORY_BUFFER_LINES: usize = 50;

/// Default history base directory, relative to the working directory.
pub const DEFAULT_HISTORY_DIR: &str = ".nerve/history";

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn history_path(base_dir: &Path, server_name: &str, session_name: &str, node_id: &str) -> PathBuf {
    base_dir
        .join(server_name)
        .join(session_name)
        .join(format!("{node_id}.jsonl"))
}

struct WriterInner {
    seq: u64,
    file: Option<File>,
    closed: bool,
    last_op: Option<String>,
}

/// Append-only JSONL writer for one node's operations.
pub struct HistoryWriter {
    pub node_id: String,
    pub server_name: String,
    pub session_name: String,
    pub file_path: PathBuf,
    enabled: bool,
    inner: Mutex<WriterInner>,
}

impl HistoryWriter {
    /// Create a writer, recovering the sequence number from any existing
    /// file and reopening it in append mode.
    ///
    /// # Errors
    ///
    /// [`CoreError::History`] if directory creation or file access fails;
    /// [`CoreError::InvalidName`] if any path component fails validation.
    pub fn create(
        node_id: &str,
        server_name: &str,
        session_name: &str,
        base_dir: Option<&Path>,
        enabled: bool,
    ) -> Result<Self> {
        // Names become path components; validate to block traversal.
        validate_name(node_id, "node")?;
        validate_name(server_name, "server")?;
        validate_name(session_name, "session")?;

        let base = base_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DIR));
        let file_path = history_path(&base, server_name, session_name, node_id);

        let writer = Self {
            node_id: node_id.to_string(),
            server_name: server_name.to_string(),
            session_name: session_name.to_string(),
            file_path: file_path.clone(),
            enabled,
            inner: Mutex::new(WriterInner {
                seq: 0,
                file: None,
                closed: false,
                last_op: None,
            }),
        };

        if !enabled {
            return Ok(writer);
        }

        let parent = file_path.parent().expect("history path has a parent");
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::History(format!("failed to create {}: {e}", parent.display())))?;

        let recovered = if file_path.exists() {
            recover_last_seq(&file_path)
        } else {
            0
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .map_err(|e| CoreError::History(format!("failed to open {}: {e}", file_path.display())))?;

        {
            let mut inner = writer.inner.lock();
            inner.seq = recovered;
            inner.file = Some(file);
        }

        Ok(writer)
    }

    /// Whether this writer is accepting entries.
    pub fn enabled(&self) -> bool {
        self.enabled && !self.inner.lock().closed
    }

    /// Current sequence number (last assigned).
    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Operation type of the most recent entry.
    pub fn last_op(&self) -> Option<String> {
        self.inner.lock().last_op.clone()
    }

    /// Whether the previous operation was fire-and-forget (`run`/`write`)
    /// and the next interaction should capture a deferred buffer snapshot.
    pub fn needs_buffer_capture(&self) -> bool {
        matches!(
            self.inner.lock().last_op.as_deref(),
            Some("run") | Some("write")
        )
    }

    fn write_entry(&self, op: &str, extend: impl FnOnce(&mut serde_json::Map<String, Value>)) -> u64 {
        let mut inner = self.inner.lock();
        if !self.enabled || inner.closed || inner.file.is_none() {
            return 0;
        }

        let seq = inner.seq + 1;
        let mut entry = serde_json::Map::new();
        entry.insert("seq".into(), json!(seq));
        entry.insert("op".into(), json!(op));
        extend(&mut entry);

        let line = match serde_json::to_string(&Value::Object(entry)) {
            Ok(line) => line,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "history serialization failed");
                return 0;
            }
        };

        let file = inner.file.as_mut().expect("checked above");
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| {
            file.write_all(b"\n")?;
            file.flush()
        }) {
            warn!(node_id = %self.node_id, error = %e, "history write failed");
            return 0;
        }

        inner.seq = seq;
        inner.last_op = Some(op.to_string());
        seq
    }

    /// Log a fire-and-forget program start.
    pub fn log_run(&self, command: &str) -> u64 {
        self.write_entry("run", |e| {
            e.insert("ts".into(), json!(now_iso()));
            e.insert("input".into(), json!(command));
        })
    }

    /// Log a raw write.
    pub fn log_write(&self, data: &str) -> u64 {
        self.write_entry("write", |e| {
            e.insert("ts".into(), json!(now_iso()));
            e.insert("input".into(), json!(data));
        })
    }

    /// Log a buffer snapshot.
    pub fn log_read(&self, buffer: &str, lines: usize) -> u64 {
        self.write_entry("read", |e| {
            e.insert("ts".into(), json!(now_iso()));
            e.insert("buffer".into(), json!(buffer));
            e.insert("lines".into(), json!(lines));
        })
    }

    /// Log a request/response interaction with its parsed response.
    pub fn log_send(
        &self,
        input: &str,
        response: Value,
        preceding_buffer_seq: Option<u64>,
        ts_start: DateTime<Utc>,
    ) -> u64 {
        self.write_entry("send", |e| {
            e.insert(
                "ts_start".into(),
                json!(ts_start.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
            e.insert("ts_end".into(), json!(now_iso()));
            e.insert("input".into(), json!(input));
            e.insert("preceding_buffer_seq".into(), json!(preceding_buffer_seq));
            e.insert("response".into(), response);
        })
    }

    /// Log a streaming interaction with the final buffer tail.
    pub fn log_send_stream(
        &self,
        input: &str,
        final_buffer: &str,
        parser: &str,
        preceding_buffer_seq: Option<u64>,
        ts_start: DateTime<Utc>,
    ) -> u64 {
        self.write_entry("send_stream", |e| {
            e.insert(
                "ts_start".into(),
                json!(ts_start.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
            e.insert("ts_end".into(), json!(now_iso()));
            e.insert("input".into(), json!(input));
            e.insert("preceding_buffer_seq".into(), json!(preceding_buffer_seq));
            e.insert("final_buffer".into(), json!(final_buffer));
            e.insert("parser".into(), json!(parser));
        })
    }

    /// Log an interrupt marker.
    pub fn log_interrupt(&self) -> u64 {
        self.write_entry("interrupt", |e| {
            e.insert("ts".into(), json!(now_iso()));
        })
    }

    /// Log a delete marker.
    pub fn log_delete(&self, reason: Option<&str>) -> u64 {
        self.write_entry("delete", |e| {
            e.insert("ts".into(), json!(now_iso()));
            e.insert("reason".into(), json!(reason));
        })
    }

    /// Close the writer. Further log calls return 0.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.file = None;
    }
}

/// Scan an existing history file for the highest `seq`, skipping malformed
/// lines with a warning.
fn recover_last_seq(path: &Path) -> u64 {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return 0,
    };

    let mut last_seq = 0u64;
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(entry) => {
                if let Some(seq) = entry.get("seq").and_then(Value::as_u64) {
                    last_seq = last_seq.max(seq);
                }
            }
            Err(_) => {
                warn!(path = %path.display(), line = line_num + 1, "skipping malformed history line");
            }
        }
    }
    last_seq
}

/// Reader over a node's history file.
///
/// Loads the whole file into memory; history files are small in practice.
pub struct HistoryReader {
    pub node_id: String,
    pub server_name: String,
    pub session_name: String,
    pub file_path: PathBuf,
}

impl HistoryReader {
    /// Open a reader for an existing history file.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the file does not exist.
    pub fn create(
        node_id: &str,
        server_name: &str,
        session_name: &str,
        base_dir: Option<&Path>,
    ) -> Result<Self> {
        let base = base_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DIR));
        let file_path = history_path(&base, server_name, session_name, node_id);

        if !file_path.exists() {
            return Err(CoreError::NotFound {
                kind: "history",
                id: node_id.to_string(),
            });
        }

        Ok(Self {
            node_id: node_id.to_string(),
            server_name: server_name.to_string(),
            session_name: session_name.to_string(),
            file_path,
        })
    }

    fn load_entries(&self) -> Vec<Value> {
        let file = match File::open(&self.file_path) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        let mut entries = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => {
                    warn!(path = %self.file_path.display(), line = line_num + 1, "skipping malformed history line");
                }
            }
        }
        entries
    }

    /// All entries in file order.
    pub fn get_all(&self) -> Vec<Value> {
        self.load_entries()
    }

    /// Last `n` entries.
    pub fn get_last(&self, n: usize) -> Vec<Value> {
        let mut entries = self.load_entries();
        let start = entries.len().saturating_sub(n);
        entries.split_off(start)
    }

    /// Entries whose `op` matches.
    pub fn get_by_op(&self, op: &str) -> Vec<Value> {
        self.load_entries()
            .into_iter()
            .filter(|e| e.get("op").and_then(Value::as_str) == Some(op))
            .collect()
    }

    /// Entry with the given sequence number, if any.
    pub fn get_by_seq(&self, seq: u64) -> Option<Value> {
        self.load_entries()
            .into_iter()
            .find(|e| e.get("seq").and_then(Value::as_u64) == Some(seq))
    }

    /// Only the input operations (`send`, `send_stream`, `write`, `run`).
    pub fn get_inputs_only(&self) -> Vec<Value> {
        let input_ops: HashSet<&str> = ["send", "send_stream", "write", "run"].into();
        self.load_entries()
            .into_iter()
            .filter(|e| {
                e.get("op")
                    .and_then(Value::as_str)
                    .is_some_and(|op| input_ops.contains(op))
            })
            .collect()
    }
}
