//! WezTerm pane backend.
//!
//! Drives a terminal pane through the `wezterm cli` control utility instead
//! of owning a PTY directly. A polling task refreshes the pane text
//! periodically; the node contract is otherwise indistinguishable from the
//! native PTY backend.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::debug;

use super::{slice_from, tail_of, BackendConfig, TerminalBackend};
use crate::error::{CoreError, Result};

/// How often the pane text is refreshed.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How much scrollback to request per poll.
const SCROLLBACK_LINES: i64 = 2000;

/// Backend driving a WezTerm pane via `wezterm cli`.
pub struct WezTermBackend {
    pane_id: String,
    /// Whether we attached to an existing pane (and must not kill it).
    attached: bool,
    buffer: Arc<Mutex<String>>,
    alive: Arc<AtomicBool>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

async fn wezterm_cli(args: &[&str]) -> Result<String> {
    let output = Command::new("wezterm")
        .arg("cli")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CoreError::Execution(format!("wezterm cli failed to start: {e}")))?;

    if !output.status.success() {
        return Err(CoreError::Execution(format!(
            "wezterm cli {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl WezTermBackend {
    /// Spawn a new pane running `command`.
    pub async fn spawn(command: &[String], config: &BackendConfig) -> Result<Self> {
        let mut args: Vec<String> = vec!["spawn".into()];
        if let Some(cwd) = &config.cwd {
            args.push("--cwd".into());
            args.push(cwd.display().to_string());
        }
        args.push("--".into());
        args.extend(command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let pane_id = wezterm_cli(&arg_refs).await?.trim().to_string();
        if pane_id.is_empty() {
            return Err(CoreError::Execution("wezterm spawn returned no pane id".into()));
        }
        debug!(pane_id = %pane_id, "spawned wezterm pane");

        Ok(Self::start(pane_id, false))
    }

    /// Attach to an existing pane; verifies the pane answers `get-text`.
    pub async fn attach(pane_id: &str) -> Result<Self> {
        wezterm_cli(&["get-text", "--pane-id", pane_id])
            .await
            .map_err(|e| CoreError::Execution(format!("cannot attach to pane {pane_id}: {e}")))?;
        Ok(Self::start(pane_id.to_string(), true))
    }

    fn start(pane_id: String, attached: bool) -> Self {
        let buffer = Arc::new(Mutex::new(String::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let poll_buffer = Arc::clone(&buffer);
        let poll_alive = Arc::clone(&alive);
        let poll_pane = pane_id.clone();
        let poller = tokio::spawn(async move {
            let start_line = format!("-{SCROLLBACK_LINES}");
            while poll_alive.load(Ordering::SeqCst) {
                match wezterm_cli(&[
                    "get-text",
                    "--pane-id",
                    &poll_pane,
                    "--start-line",
                    &start_line,
                ])
                .await
                {
                    Ok(text) => {
                        let mut guard = poll_buffer.lock();
                        // Pane scrollback is already cumulative; keep the
                        // longest capture so the buffer never shrinks.
                        if text.len() >= guard.len() {
                            *guard = text;
                        }
                    }
                    Err(_) => {
                        poll_alive.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });

        Self {
            pane_id,
            attached,
            buffer,
            alive,
            poller: Mutex::new(Some(poller)),
        }
    }

    /// Pane this backend is bound to.
    pub fn pane_id(&self) -> &str {
        &self.pane_id
    }
}

#[async_trait]
impl TerminalBackend for WezTermBackend {
    fn backend_type(&self) -> &'static str {
        "wezterm"
    }

    async fn write(&self, data: &str) -> Result<()> {
        let output = Command::new("wezterm")
            .args(["cli", "send-text", "--pane-id", &self.pane_id, "--no-paste"])
            .arg(data)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CoreError::Execution(format!("wezterm send-text failed: {e}")))?;

        if !output.status.success() {
            return Err(CoreError::Execution(format!(
                "wezterm send-text failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn buffer(&self) -> String {
        self.buffer.lock().clone()
    }

    fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    fn buffer_from(&self, start: usize) -> String {
        slice_from(&self.buffer.lock(), start)
    }

    fn read_tail(&self, lines: usize) -> String {
        tail_of(&self.buffer.lock(), lines)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        // Only kill panes we spawned; attached panes belong to the user.
        if !self.attached {
            let _ = wezterm_cli(&["kill-pane", "--pane-id", &self.pane_id]).await;
        }
    }
}
