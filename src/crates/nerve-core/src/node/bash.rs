//! Stateless node for running shell commands.
//!
//! Each execution spawns a fresh subprocess; nothing persists between
//! calls. Errors never propagate as `Err` - they populate the `error` field
//! of the structured result, so graph steps can observe failures as data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionContext, Node, NodeInfo, NodeState};
use crate::error::Result;
use crate::session::Session;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Node that runs shell commands and returns structured results.
///
/// The result object always carries `{success, stdout, stderr, exit_code,
/// command, error, interrupted, output}` where `output` aliases `stdout` for
/// uniform template interpolation.
pub struct BashNode {
    id: String,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    timeout: Duration,
    metadata: Value,
    state: Mutex<NodeState>,
    /// Pid of the currently running child, for `interrupt`.
    current_pid: Mutex<Option<u32>>,
}

impl BashNode {
    /// Create and register a bash node in `session`.
    pub fn create(
        id: &str,
        session: &Arc<Session>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let node = Arc::new(Self {
            id: id.to_string(),
            cwd,
            env,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            metadata: Value::Object(Default::default()),
            state: Mutex::new(NodeState::Ready),
            current_pid: Mutex::new(None),
        });
        session.register_node(node.clone())?;
        Ok(node)
    }

    fn result_skeleton(command: &str) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("success".into(), json!(false));
        map.insert("stdout".into(), json!(""));
        map.insert("stderr".into(), json!(""));
        map.insert("exit_code".into(), Value::Null);
        map.insert("command".into(), json!(command));
        map.insert("error".into(), Value::Null);
        map.insert("interrupted".into(), json!(false));
        map.insert("output".into(), json!(""));
        map
    }
}

#[async_trait]
impl Node for BashNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "bash"
    }

    fn state(&self) -> NodeState {
        *self.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        let command = ctx.input_str();
        let mut result = Self::result_skeleton(&command);

        if self.state() == NodeState::Stopped {
            result.insert("error".into(), json!("Node is stopped"));
            return Ok(Value::Object(result));
        }

        if command.is_empty() {
            result.insert("error".into(), json!("No command provided in input"));
            return Ok(Value::Object(result));
        }

        let timeout = ctx.timeout.unwrap_or(self.timeout);
        debug!(node_id = %self.id, exec_id = %ctx.exec_id, %command, timeout_s = timeout.as_secs_f64(), "bash_start");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                result.insert("error".into(), json!(format!("failed to spawn: {e}")));
                return Ok(Value::Object(result));
            }
        };

        *self.current_pid.lock() = child.id();

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let waited = tokio::time::timeout(timeout, async {
            let (out, err, status) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr),
                child.wait(),
            );
            out?;
            err?;
            status
        })
        .await;

        *self.current_pid.lock() = None;

        match waited {
            Ok(Ok(status)) => {
                result.insert(
                    "stdout".into(),
                    json!(String::from_utf8_lossy(&stdout).into_owned()),
                );
                result.insert(
                    "stderr".into(),
                    json!(String::from_utf8_lossy(&stderr).into_owned()),
                );
                result.insert("output".into(), result["stdout"].clone());

                let code = status.code();
                result.insert("exit_code".into(), json!(code));

                #[cfg(unix)]
                let signalled_int = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal() == Some(libc::SIGINT)
                };
                #[cfg(not(unix))]
                let signalled_int = false;

                if signalled_int || code == Some(130) {
                    result.insert("interrupted".into(), json!(true));
                    result.insert("error".into(), json!("Command interrupted (Ctrl+C)"));
                    warn!(node_id = %self.id, exec_id = %ctx.exec_id, "bash_interrupted");
                } else if code == Some(0) {
                    result.insert("success".into(), json!(true));
                    debug!(node_id = %self.id, exec_id = %ctx.exec_id, "bash_complete");
                } else {
                    let msg = match code {
                        Some(code) => format!("Command exited with code {code}"),
                        None => "Process ended without exit code".to_string(),
                    };
                    result.insert("error".into(), json!(msg));
                    debug!(node_id = %self.id, exec_id = %ctx.exec_id, exit_code = ?code, "bash_failed");
                }
            }
            Ok(Err(e)) => {
                result.insert("error".into(), json!(format!("i/o error: {e}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                result.insert(
                    "error".into(),
                    json!(format!("Command timed out after {}s", timeout.as_secs_f64())),
                );
                warn!(node_id = %self.id, exec_id = %ctx.exec_id, "bash_timeout");
            }
        }

        Ok(Value::Object(result))
    }

    async fn stop(&self) {
        *self.state.lock() = NodeState::Stopped;
    }

    /// Send SIGINT to the running child. Safe to call at any time, including
    /// when no execution is in progress.
    async fn interrupt(&self) {
        let pid = *self.current_pid.lock();
        if let Some(pid) = pid {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
            #[cfg(not(unix))]
            let _ = pid;
        }
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: "bash".into(),
            state: self.state(),
            persistent: false,
            metadata: json!({
                "cwd": self.cwd.as_ref().map(|p| p.display().to_string()),
                "timeout": self.timeout.as_secs_f64(),
                "env_vars": self.env.keys().collect::<Vec<_>>(),
                "extra": self.metadata,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn node(session: &Arc<Session>, id: &str) -> Arc<BashNode> {
        BashNode::create(id, session, None, HashMap::new(), None).unwrap()
    }

    #[tokio::test]
    async fn echo_returns_stdout() {
        let session = Session::new("bash-echo", "test");
        let node = node(&session, "b");

        let ctx = ExecutionContext::new(session).with_input(json!("echo hello"));
        let result = node.execute(ctx).await.unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(result["stdout"], "hello\n");
        assert_eq!(result["output"], "hello\n");
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["interrupted"], false);
    }

    #[tokio::test]
    async fn nonzero_exit_populates_error() {
        let session = Session::new("bash-fail", "test");
        let node = node(&session, "b");

        let ctx = ExecutionContext::new(session).with_input(json!("exit 3"));
        let result = node.execute(ctx).await.unwrap();

        assert_eq!(result["success"], false);
        assert_eq!(result["exit_code"], 3);
        assert!(result["error"].as_str().unwrap().contains("code 3"));
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let session = Session::new("bash-stderr", "test");
        let node = node(&session, "b");

        let ctx = ExecutionContext::new(session).with_input(json!("echo oops >&2"));
        let result = node.execute(ctx).await.unwrap();
        assert_eq!(result["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn empty_command_is_an_error_result() {
        let session = Session::new("bash-empty", "test");
        let node = node(&session, "b");

        let ctx = ExecutionContext::new(session);
        let result = node.execute(ctx).await.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("No command"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let session = Session::new("bash-timeout", "test");
        let node = node(&session, "b");

        let ctx = ExecutionContext::new(session)
            .with_input(json!("sleep 10"))
            .with_timeout(Some(Duration::from_millis(200)));
        let result = node.execute(ctx).await.unwrap();

        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_sets_interrupted_flag() {
        let session = Session::new("bash-int", "test");
        let node = node(&session, "b");

        let exec_node = node.clone();
        let ctx = ExecutionContext::new(session).with_input(json!("sleep 100"));
        let task = tokio::spawn(async move { exec_node.execute(ctx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        node.interrupt().await;

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["interrupted"], true);
        assert!(result["error"].as_str().unwrap().contains("interrupted"));
    }

    #[tokio::test]
    async fn interrupt_without_child_is_safe() {
        let session = Session::new("bash-int-idle", "test");
        let node = node(&session, "b");
        node.interrupt().await;
        node.interrupt().await;
    }

    #[tokio::test]
    async fn stopped_node_rejects_execution_as_data() {
        let session = Session::new("bash-stopped", "test");
        let node = node(&session, "b");
        node.stop().await;

        let ctx = ExecutionContext::new(session).with_input(json!("echo hi"));
        let result = node.execute(ctx).await.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("stopped"));
    }
}
