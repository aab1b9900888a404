//! Context passed to workflow functions.
//!
//! Provides the helpers a workflow body composes: dispatching nodes and
//! graphs, running nested workflows, pausing at gates, and emitting custom
//! events onto the run's stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::run::{EventCallback, GateInfo, WorkflowRun};
use crate::error::{CoreError, Result};
use crate::node::ExecutionContext;
use crate::session::Session;

/// Context handed to a workflow body.
#[derive(Clone)]
pub struct WorkflowContext {
    /// Session containing the nodes/graphs/workflows this run may use.
    pub session: Arc<Session>,
    /// Input passed when the run started.
    pub input: Value,
    /// Extra parameters passed at execution time.
    pub params: Value,
    /// Mutable scratch space for cross-iteration bookkeeping.
    pub state: Arc<Mutex<Map<String, Value>>>,
    run: Arc<WorkflowRun>,
}

impl WorkflowContext {
    pub(crate) fn new(
        session: Arc<Session>,
        input: Value,
        params: Value,
        run: Arc<WorkflowRun>,
    ) -> Self {
        Self {
            session,
            input,
            params,
            state: Arc::new(Mutex::new(Map::new())),
            run,
        }
    }

    /// The run this context belongs to.
    pub fn run_id(&self) -> &str {
        self.run.run_id()
    }

    /// Execute a node and return its result object.
    ///
    /// Emits `node_started` / `node_completed` (or `node_timeout` /
    /// `node_error`) around the call.
    pub async fn run(
        &self,
        node_id: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let node = self.session.get_node(node_id).ok_or(CoreError::NotFound {
            kind: "node",
            id: node_id.to_string(),
        })?;

        self.emit(
            "node_started",
            json!({"node_id": node_id, "input": input_preview(&input)}),
        );

        let ctx = ExecutionContext::new(self.session.clone())
            .with_input(input)
            .with_timeout(timeout);

        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, node.execute(ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.emit(
                        "node_timeout",
                        json!({"node_id": node_id, "timeout": t.as_secs_f64()}),
                    );
                    return Err(CoreError::Timeout(t.as_secs_f64()));
                }
            },
            None => node.execute(ctx).await,
        };

        match outcome {
            Ok(result) => {
                self.emit(
                    "node_completed",
                    json!({
                        "node_id": node_id,
                        "success": result.get("success").and_then(Value::as_bool).unwrap_or(false),
                        "output": input_preview(&result.get("output").cloned().unwrap_or(Value::Null)),
                    }),
                );
                Ok(result)
            }
            Err(e) => {
                self.emit(
                    "node_error",
                    json!({"node_id": node_id, "error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    /// Execute a graph and return its result envelope.
    pub async fn run_graph(
        &self,
        graph_id: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let graph = self.session.get_graph(graph_id).ok_or(CoreError::NotFound {
            kind: "graph",
            id: graph_id.to_string(),
        })?;

        self.emit(
            "graph_started",
            json!({"graph_id": graph_id, "input": input_preview(&input)}),
        );

        let ctx = ExecutionContext::new(self.session.clone()).with_input(input);

        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, graph.execute(ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.emit(
                        "graph_timeout",
                        json!({"graph_id": graph_id, "timeout": t.as_secs_f64()}),
                    );
                    return Err(CoreError::Timeout(t.as_secs_f64()));
                }
            },
            None => graph.execute(ctx).await,
        };

        match outcome {
            Ok(result) => {
                self.emit(
                    "graph_completed",
                    json!({
                        "graph_id": graph_id,
                        "success": result.get("success").and_then(Value::as_bool).unwrap_or(false),
                        "output": input_preview(&result.get("output").cloned().unwrap_or(Value::Null)),
                    }),
                );
                Ok(result)
            }
            Err(e) => {
                self.emit(
                    "graph_error",
                    json!({"graph_id": graph_id, "error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    /// Execute another workflow as a child run and return its result.
    ///
    /// The child registers in the session's run registry (so its gates can
    /// be answered), forwards every event onto this run's stream under
    /// `nested:<type>`, and unregisters on completion. Cancelling this run
    /// cancels the child; a child that already completed is left untouched.
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        timeout: Option<Duration>,
        params: Option<Value>,
    ) -> Result<Value> {
        let workflow = self
            .session
            .get_workflow(workflow_id)
            .ok_or(CoreError::NotFound {
                kind: "workflow",
                id: workflow_id.to_string(),
            })?;

        self.emit(
            "nested_workflow_started",
            json!({"workflow_id": workflow_id, "input": input_preview(&input)}),
        );

        let parent = Arc::clone(&self.run);
        let nested_id = workflow_id.to_string();
        let forward: EventCallback = Arc::new(move |event| {
            let parent = Arc::clone(&parent);
            let nested_id = nested_id.clone();
            Box::pin(async move {
                let mut data = Map::new();
                data.insert("nested_workflow_id".into(), json!(nested_id));
                data.insert("nested_run_id".into(), json!(event.run_id));
                if let Value::Object(extra) = event.data {
                    data.extend(extra);
                }
                parent.emit_event(&format!("nested:{}", event.event_type), Value::Object(data));
            })
        });

        let child = WorkflowRun::new(
            workflow,
            input,
            params.unwrap_or_else(|| json!({})),
            Some(forward),
            Some(self.run.cancel_token()),
        );
        self.session.register_run(&child);

        let outcome = async {
            child.start(self.session.clone())?;
            match timeout {
                Some(t) => match tokio::time::timeout(t, child.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        child.cancel().await;
                        self.emit(
                            "nested_workflow_timeout",
                            json!({"workflow_id": workflow_id, "timeout": t.as_secs_f64()}),
                        );
                        return Err(CoreError::Timeout(t.as_secs_f64()));
                    }
                },
                None => child.wait().await,
            }
        }
        .await;

        let outcome = match outcome {
            Ok(value) => {
                self.emit(
                    "nested_workflow_completed",
                    json!({
                        "workflow_id": workflow_id,
                        "run_id": child.run_id(),
                        "success": true,
                    }),
                );
                Ok(value)
            }
            Err(CoreError::Cancelled) => {
                self.emit(
                    "nested_workflow_cancelled",
                    json!({"workflow_id": workflow_id}),
                );
                Err(CoreError::Cancelled)
            }
            Err(CoreError::Timeout(t)) => Err(CoreError::Timeout(t)),
            Err(e) => {
                self.emit(
                    "nested_workflow_error",
                    json!({"workflow_id": workflow_id, "error": e.to_string()}),
                );
                Err(e)
            }
        };

        self.session.unregister_run(child.run_id());
        outcome
    }

    /// Pause execution until a human answers.
    ///
    /// Registers a pending gate, flips the run to Waiting, emits
    /// `gate_waiting`, and suspends until [`WorkflowRun::answer_gate`]
    /// completes the slot. A timeout unregisters the gate and returns
    /// [`CoreError::Timeout`].
    pub async fn gate(
        &self,
        prompt: &str,
        timeout: Option<Duration>,
        choices: Option<Vec<String>>,
    ) -> Result<String> {
        let gate_id = Uuid::new_v4().to_string()[..8].to_string();
        let (tx, rx) = oneshot::channel();

        self.run.register_gate(Arc::new(GateInfo::new(
            gate_id.clone(),
            prompt.to_string(),
            choices.clone(),
            tx,
        )));

        self.emit(
            "gate_waiting",
            json!({"gate_id": gate_id, "prompt": prompt, "choices": choices}),
        );

        let answered = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(answered) => answered,
                Err(_) => {
                    self.run.unregister_gate(&gate_id);
                    self.emit(
                        "gate_timeout",
                        json!({"gate_id": gate_id, "timeout": t.as_secs_f64()}),
                    );
                    return Err(CoreError::Timeout(t.as_secs_f64()));
                }
            },
            None => rx.await,
        };

        match answered {
            Ok(answer) => {
                self.emit(
                    "gate_answered",
                    json!({"gate_id": gate_id, "answer": answer}),
                );
                Ok(answer)
            }
            Err(_) => {
                // Sender dropped without an answer: the run is going away.
                self.run.unregister_gate(&gate_id);
                self.emit("gate_cancelled", json!({"gate_id": gate_id}));
                Err(CoreError::Cancelled)
            }
        }
    }

    /// Emit a custom event onto this run's stream.
    pub fn emit(&self, event_type: &str, data: Value) {
        self.run.emit_event(event_type, data);
    }
}

/// Stringified preview of a value for event payloads.
fn input_preview(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
