//! Workflow run: one execution of a workflow.
//!
//! Tracks execution state, owns the pending gate slot, and records an
//! append-only event log. The user function runs in a cancelable background
//! task; cancellation propagates to nested child runs through child tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::events::WorkflowEvent;
use super::{BoxFuture, Workflow, WorkflowContext};
use crate::error::{CoreError, Result};
use crate::session::Session;

/// Execution state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Waiting => "waiting",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

/// Async callback invoked for every run event (fire-and-forget).
pub type EventCallback = Arc<dyn Fn(WorkflowEvent) -> BoxFuture<()> + Send + Sync>;

/// A pending gate: a named suspension point with a single-use answer slot.
pub struct GateInfo {
    pub gate_id: String,
    pub prompt: String,
    pub choices: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    sender: Mutex<Option<oneshot::Sender<String>>>,
}

impl GateInfo {
    pub(crate) fn new(
        gate_id: String,
        prompt: String,
        choices: Option<Vec<String>>,
        sender: oneshot::Sender<String>,
    ) -> Self {
        Self {
            gate_id,
            prompt,
            choices,
            created_at: Utc::now(),
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "gate_id": self.gate_id,
            "prompt": self.prompt,
            "choices": self.choices,
        })
    }
}

/// A single execution of a workflow.
pub struct WorkflowRun {
    run_id: String,
    workflow: Arc<Workflow>,
    input: Value,
    params: Value,
    state: Mutex<WorkflowState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
    result: Mutex<Value>,
    error: Mutex<Option<String>>,
    pending_gate: Mutex<Option<Arc<GateInfo>>>,
    events: Mutex<Vec<WorkflowEvent>>,
    callback: Option<EventCallback>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkflowRun {
    /// Create a run in the Pending state. `parent_cancel` links this run
    /// into a parent's cancellation tree (nested runs).
    pub fn new(
        workflow: Arc<Workflow>,
        input: Value,
        params: Value,
        callback: Option<EventCallback>,
        parent_cancel: Option<&CancellationToken>,
    ) -> Arc<Self> {
        let cancel = parent_cancel
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (done, _) = watch::channel(false);

        let run = Arc::new(Self {
            run_id: Uuid::new_v4().to_string(),
            workflow,
            input,
            params,
            state: Mutex::new(WorkflowState::Pending),
            started_at: Mutex::new(None),
            completed_at: Mutex::new(None),
            result: Mutex::new(Value::Null),
            error: Mutex::new(None),
            pending_gate: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            callback,
            cancel,
            done,
            task: Mutex::new(None),
        });
        debug!(run_id = %run.run_id, workflow_id = %run.workflow.id(), "workflow run created");
        run
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        self.workflow.id()
    }

    pub fn state(&self) -> WorkflowState {
        *self.state.lock()
    }

    pub fn result(&self) -> Value {
        self.result.lock().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.state(),
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn pending_gate(&self) -> Option<Arc<GateInfo>> {
        self.pending_gate.lock().clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start executing the workflow function in a background task.
    ///
    /// Returns immediately; use [`wait`](Self::wait) to block until done.
    pub fn start(self: &Arc<Self>, session: Arc<Session>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WorkflowState::Pending {
                return Err(CoreError::Execution(format!(
                    "cannot start run in state {}",
                    state.as_str()
                )));
            }
            *state = WorkflowState::Running;
        }
        *self.started_at.lock() = Some(Utc::now());

        self.emit_event(
            "workflow_started",
            json!({"run_id": self.run_id, "workflow_id": self.workflow.id()}),
        );

        let ctx = WorkflowContext::new(session, self.input.clone(), self.params.clone(), self.clone());

        let run = Arc::clone(self);
        let body = self.workflow.body();
        let handle = tokio::spawn(async move {
            let fut = (body)(ctx);
            tokio::select! {
                _ = run.cancel.cancelled() => run.finish_cancelled(),
                outcome = fut => match outcome {
                    Ok(value) => run.finish_ok(value),
                    Err(CoreError::Cancelled) => run.finish_cancelled(),
                    Err(e) => run.finish_err(e.to_string()),
                },
            }
            let _ = run.done.send(true);
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    fn finish_ok(&self, value: Value) {
        if self.is_complete() {
            return;
        }
        *self.result.lock() = value.clone();
        *self.state.lock() = WorkflowState::Completed;
        *self.completed_at.lock() = Some(Utc::now());
        debug!(run_id = %self.run_id, "workflow run completed");
        self.emit_event(
            "workflow_completed",
            json!({"run_id": self.run_id, "result": value}),
        );
    }

    fn finish_err(&self, message: String) {
        if self.is_complete() {
            return;
        }
        *self.error.lock() = Some(message.clone());
        *self.state.lock() = WorkflowState::Failed;
        *self.completed_at.lock() = Some(Utc::now());
        error!(run_id = %self.run_id, error = %message, "workflow run failed");
        self.emit_event(
            "workflow_failed",
            json!({"run_id": self.run_id, "error": message}),
        );
    }

    fn finish_cancelled(&self) {
        if self.is_complete() {
            return;
        }
        // A cancelled run abandons its pending gate.
        let gate = self.pending_gate.lock().take();
        if let Some(gate) = gate {
            self.emit_event("gate_cancelled", json!({"gate_id": gate.gate_id}));
        }
        *self.state.lock() = WorkflowState::Cancelled;
        *self.completed_at.lock() = Some(Utc::now());
        debug!(run_id = %self.run_id, "workflow run cancelled");
        self.emit_event("workflow_cancelled", json!({"run_id": self.run_id}));
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> Result<Value> {
        let mut rx = self.done.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        match self.state() {
            WorkflowState::Completed => Ok(self.result()),
            WorkflowState::Cancelled => Err(CoreError::Cancelled),
            WorkflowState::Failed => Err(CoreError::Execution(
                self.error().unwrap_or_else(|| "workflow failed".into()),
            )),
            other => Err(CoreError::Execution(format!(
                "workflow run ended in unexpected state {}",
                other.as_str()
            ))),
        }
    }

    /// Cancel the run. No-op when the run already completed.
    pub async fn cancel(&self) {
        if self.is_complete() {
            return;
        }
        if self.task.lock().is_none() {
            // Never started; settle immediately instead of waiting on a
            // driver task that does not exist.
            self.cancel.cancel();
            self.finish_cancelled();
            let _ = self.done.send(true);
            return;
        }
        self.cancel.cancel();

        let mut rx = self.done.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Answer the pending gate.
    ///
    /// # Errors
    ///
    /// [`CoreError::Gate`] when no gate is pending or the answer is not one
    /// of the gate's choices.
    pub fn answer_gate(&self, answer: &str) -> Result<()> {
        let mut pending = self.pending_gate.lock();
        let gate = pending
            .as_ref()
            .ok_or_else(|| CoreError::Gate("No gate pending".into()))?;

        if let Some(choices) = &gate.choices {
            if !choices.iter().any(|c| c == answer) {
                return Err(CoreError::Gate(format!(
                    "Invalid choice '{answer}'. Must be one of: {choices:?}"
                )));
            }
        }

        debug!(run_id = %self.run_id, gate_id = %gate.gate_id, "gate answered");
        let sender = gate.sender.lock().take();
        match sender {
            Some(sender) => {
                if sender.send(answer.to_string()).is_err() {
                    warn!(run_id = %self.run_id, "gate receiver dropped before answer");
                }
            }
            None => return Err(CoreError::Gate("Gate already answered".into())),
        }

        *pending = None;
        *self.state.lock() = WorkflowState::Running;
        Ok(())
    }

    pub(crate) fn register_gate(&self, gate: Arc<GateInfo>) {
        *self.pending_gate.lock() = Some(gate);
        *self.state.lock() = WorkflowState::Waiting;
    }

    pub(crate) fn unregister_gate(&self, gate_id: &str) {
        let mut pending = self.pending_gate.lock();
        if pending.as_ref().is_some_and(|g| g.gate_id == gate_id) {
            *pending = None;
            *self.state.lock() = WorkflowState::Running;
        }
    }

    /// Append an event to the run log and fire the callback without
    /// blocking the workflow.
    pub(crate) fn emit_event(&self, event_type: &str, data: Value) {
        let event = WorkflowEvent::new(&self.run_id, self.workflow.id(), event_type, data);
        self.events.lock().push(event.clone());

        if let Some(callback) = &self.callback {
            let fut = callback(event);
            tokio::spawn(fut);
        }
    }

    /// Event log snapshot.
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    /// Serializable run metadata.
    pub fn to_info(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "workflow_id": self.workflow.id(),
            "state": self.state().as_str(),
            "started_at": self.started_at.lock().map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.lock().map(|t| t.to_rfc3339()),
            "result": self.result(),
            "error": self.error(),
            "pending_gate": self.pending_gate().map(|g| g.to_value()),
            "events": self.events().iter().map(|e| e.to_value()).collect::<Vec<_>>(),
        })
    }
}
