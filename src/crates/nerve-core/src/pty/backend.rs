//! Native pseudo-terminal backend.
//!
//! Spawns a child process attached to a PTY and drains its output on a
//! dedicated reader thread into a grow-only buffer. The reader thread is
//! required: a PTY is a continuous stream, and unread output would block the
//! child once the kernel buffer fills.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::debug;

use super::{slice_from, tail_of, BackendConfig, TerminalBackend};
use crate::error::{CoreError, Result};

/// Pseudo-terminal backend owning a child process.
pub struct PtyBackend {
    command: Vec<String>,
    buffer: Arc<Mutex<String>>,
    alive: Arc<AtomicBool>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    // Keeps the PTY master fd open for the life of the backend.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PtyBackend {
    /// Spawn `command` inside a fresh PTY and start the reader thread.
    pub fn spawn(command: &[String], config: &BackendConfig) -> Result<Self> {
        if command.is_empty() {
            return Err(CoreError::Execution("empty command".into()));
        }

        let pty = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Execution(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&command[0]);
        cmd.args(&command[1..]);
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pty
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::Execution(format!("failed to spawn '{}': {e}", command[0])))?;
        drop(pty.slave);

        let mut reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| CoreError::Execution(format!("failed to clone pty reader: {e}")))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| CoreError::Execution(format!("failed to take pty writer: {e}")))?;

        let buffer = Arc::new(Mutex::new(String::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_buffer = Arc::clone(&buffer);
        let reader_alive = Arc::clone(&alive);
        let handle = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let text = String::from_utf8_lossy(&chunk[..n]);
                            reader_buffer.lock().push_str(&text);
                        }
                    }
                }
                reader_alive.store(false, Ordering::SeqCst);
                debug!("pty reader exited");
            })
            .map_err(|e| CoreError::Execution(format!("failed to start pty reader: {e}")))?;

        Ok(Self {
            command: command.to_vec(),
            buffer,
            alive,
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            master: Mutex::new(Some(pty.master)),
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Command line this backend was spawned with.
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    fn backend_type(&self) -> &'static str {
        "pty"
    }

    async fn write(&self, data: &str) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| CoreError::Execution("pty writer closed".into()))?;
        writer
            .write_all(data.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(CoreError::Io)
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
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
        }
        self.alive.store(false, Ordering::SeqCst);
        // Dropping the writer and master closes the PTY, which unblocks the
        // reader thread.
        self.writer.lock().take();
        self.master.lock().take();
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BackendConfig {
        BackendConfig::default()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not met within 5s");
    }

    #[tokio::test]
    async fn captures_child_output() {
        let backend =
            PtyBackend::spawn(&["sh".into(), "-c".into(), "echo marker-123".into()], &config())
                .unwrap();

        wait_for(|| backend.buffer().contains("marker-123")).await;
        backend.stop().await;
    }

    #[tokio::test]
    async fn write_round_trips_through_shell() {
        let backend = PtyBackend::spawn(&["sh".into()], &config()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        backend.write("echo round-trip-ok\n").await.unwrap();
        wait_for(|| backend.buffer().contains("round-trip-ok")).await;

        let tail = backend.read_tail(10);
        assert!(tail.contains("round-trip-ok"));
        backend.stop().await;
    }

    #[tokio::test]
    async fn buffer_from_skips_earlier_output() {
        let backend = PtyBackend::spawn(&["sh".into()], &config()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        backend.write("echo first\n").await.unwrap();
        wait_for(|| backend.buffer().contains("first")).await;

        let mark = backend.buffer_len();
        backend.write("echo second\n").await.unwrap();
        wait_for(|| backend.buffer().contains("second")).await;

        let suffix = backend.buffer_from(mark);
        assert!(suffix.contains("second"));
        backend.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let backend = PtyBackend::spawn(&["sh".into()], &config()).unwrap();
        backend.stop().await;
        backend.stop().await;
        assert!(!backend.is_alive());
        assert!(backend.write("x").await.is_err());
    }
}
