//! Workflow commands: register, run, answer gates, cancel.
//!
//! Workflows registered over the wire are declarative sequences compiled
//! into an imperative body: each step dispatches a node, a graph or another
//! workflow, or pauses at a gate. In-process embedders register arbitrary
//! async bodies directly through `nerve_core::workflow::Workflow::create`.

use std::sync::Arc;

use nerve_core::workflow::{Workflow, WorkflowRun};
use nerve_core::CoreError;
use serde_json::{json, Value};

use crate::error::{Result, ServerError};
use crate::protocols::{Event, EventSink};
use crate::session_registry::SessionRegistry;
use crate::validation::{get_workflow, optional_bool, optional_duration, optional_str, require_str};

pub struct WorkflowHandler {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
}

/// One step of a wire-registered workflow.
#[derive(Clone)]
enum FlowStep {
    Node { target: String, input: Option<String> },
    Graph { target: String, input: Option<String> },
    Workflow { target: String, input: Option<String> },
    Gate { prompt: String, choices: Option<Vec<String>> },
}

fn parse_flow_step(value: &Value) -> Result<FlowStep> {
    let kind = value
        .get("kind")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::InvalidParams("workflow step missing 'kind'".into()))?;

    let target = || -> Result<String> {
        value
            .get("target")
            .or_else(|| value.get("node_id"))
            .or_else(|| value.get("graph_id"))
            .or_else(|| value.get("workflow_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServerError::InvalidParams("workflow step missing 'target'".into()))
    };
    let input = value
        .get("input")
        .and_then(Value::as_str)
        .map(str::to_string);

    match kind {
        "node" => Ok(FlowStep::Node {
            target: target()?,
            input,
        }),
        "graph" => Ok(FlowStep::Graph {
            target: target()?,
            input,
        }),
        "workflow" => Ok(FlowStep::Workflow {
            target: target()?,
            input,
        }),
        "gate" => Ok(FlowStep::Gate {
            prompt: value
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or("Continue?")
                .to_string(),
            choices: value.get("choices").and_then(Value::as_array).map(|choices| {
                choices
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
        }),
        other => Err(ServerError::InvalidParams(format!(
            "unknown workflow step kind '{other}'"
        ))),
    }
}

/// Resolve a step's input template: `{input}` is the run input, `{prev}` the
/// previous step's output. A step without input receives the previous output
/// (or the run input for the first step).
fn resolve_flow_input(template: &Option<String>, initial: &Value, prev: &Value) -> Value {
    fn preview(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    match template {
        Some(template) => Value::String(
            template
                .replace("{input}", &preview(initial))
                .replace("{prev}", &preview(prev)),
        ),
        None => {
            if prev.is_null() {
                initial.clone()
            } else {
                prev.clone()
            }
        }
    }
}

/// Output to thread into the next step.
fn step_output(result: &Value) -> Value {
    result.get("output").cloned().unwrap_or_else(|| result.clone())
}

impl WorkflowHandler {
    pub fn new(registry: Arc<SessionRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self { registry, sink }
    }

    /// `REGISTER_WORKFLOW {workflow_id, steps}` - compile a declarative
    /// step sequence into a workflow body and register it.
    pub async fn register_workflow(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let workflow_id = require_str(params, "workflow_id")?;

        let steps = params
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ServerError::InvalidParams("missing or invalid 'steps' for workflow".into())
            })?;
        let flow: Vec<FlowStep> = steps
            .iter()
            .map(parse_flow_step)
            .collect::<Result<Vec<_>>>()?;
        if flow.is_empty() {
            return Err(ServerError::InvalidParams(
                "workflow needs at least one step".into(),
            ));
        }

        let step_count = flow.len();
        Workflow::create(workflow_id, &session, move |ctx| {
            let flow = flow.clone();
            async move {
                let initial = ctx.input.clone();
                let mut prev = Value::Null;
                for step in &flow {
                    prev = match step {
                        FlowStep::Node { target, input } => {
                            let input = resolve_flow_input(input, &initial, &prev);
                            let result = ctx.run(target, input, None).await?;
                            step_output(&result)
                        }
                        FlowStep::Graph { target, input } => {
                            let input = resolve_flow_input(input, &initial, &prev);
                            let result = ctx.run_graph(target, input, None).await?;
                            step_output(&result)
                        }
                        FlowStep::Workflow { target, input } => {
                            let input = resolve_flow_input(input, &initial, &prev);
                            ctx.run_workflow(target, input, None, None).await?
                        }
                        FlowStep::Gate { prompt, choices } => {
                            let answer = ctx.gate(prompt, None, choices.clone()).await?;
                            Value::String(answer)
                        }
                    };
                }
                Ok(prev)
            }
        })?;

        Ok(json!({"workflow_id": workflow_id, "step_count": step_count}))
    }

    /// `RUN_WORKFLOW {workflow_id, input?, params?, wait?, timeout?}`
    ///
    /// Starts a run and returns its id immediately; with `wait=true` the
    /// result is awaited inline. Run events are forwarded to all clients.
    pub async fn run_workflow(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let workflow_id = require_str(params, "workflow_id")?;
        let workflow = get_workflow(&session, workflow_id)?;

        let sink = Arc::clone(&self.sink);
        let callback: nerve_core::workflow::EventCallback = Arc::new(move |event| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.emit(Event::custom(&event.event_type, None, event.to_value()))
                    .await;
            })
        });

        let run = WorkflowRun::new(
            workflow,
            params.get("input").cloned().unwrap_or(Value::Null),
            params.get("params").cloned().unwrap_or_else(|| json!({})),
            Some(callback),
            None,
        );
        session.register_run(&run);
        run.start(session.clone())?;

        if optional_bool(params, "wait").unwrap_or(false) {
            let outcome = match optional_duration(params, "timeout") {
                Some(t) => match tokio::time::timeout(t, run.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        run.cancel().await;
                        session.unregister_run(run.run_id());
                        return Err(CoreError::Timeout(t.as_secs_f64()).into());
                    }
                },
                None => run.wait().await,
            };
            session.unregister_run(run.run_id());
            let result = outcome?;
            return Ok(json!({
                "run_id": run.run_id(),
                "workflow_id": workflow_id,
                "state": run.state().as_str(),
                "result": result,
            }));
        }

        // Detached run: keep it alive in a background waiter that
        // unregisters it when it finishes.
        let waiter_session = session.clone();
        let waiter_run = Arc::clone(&run);
        tokio::spawn(async move {
            let _ = waiter_run.wait().await;
            waiter_session.unregister_run(waiter_run.run_id());
        });

        Ok(json!({
            "run_id": run.run_id(),
            "workflow_id": workflow_id,
            "state": run.state().as_str(),
        }))
    }

    /// `ANSWER_GATE {run_id?, gate_id?, answer}`
    pub async fn answer_gate(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let answer = require_str(params, "answer")?;

        let run = if let Some(run_id) = optional_str(params, "run_id") {
            session.get_run(run_id).ok_or(CoreError::NotFound {
                kind: "workflow run",
                id: run_id.to_string(),
            })?
        } else if let Some(gate_id) = optional_str(params, "gate_id") {
            session
                .list_runs()
                .into_iter()
                .find(|run| {
                    run.pending_gate()
                        .is_some_and(|gate| gate.gate_id == gate_id)
                })
                .ok_or(CoreError::NotFound {
                    kind: "gate",
                    id: gate_id.to_string(),
                })?
        } else {
            // Convenience: a single waiting run is unambiguous.
            let mut waiting: Vec<Arc<WorkflowRun>> = session
                .list_runs()
                .into_iter()
                .filter(|run| run.pending_gate().is_some())
                .collect();
            match waiting.len() {
                1 => waiting.remove(0),
                0 => {
                    return Err(ServerError::InvalidParams(
                        "no run is waiting at a gate".into(),
                    ))
                }
                _ => {
                    return Err(ServerError::InvalidParams(
                        "multiple runs are waiting; pass run_id or gate_id".into(),
                    ))
                }
            }
        };

        run.answer_gate(answer)?;
        Ok(json!({"answered": true, "run_id": run.run_id()}))
    }

    /// `CANCEL_WORKFLOW {run_id}`
    pub async fn cancel_workflow(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let run_id = require_str(params, "run_id")?;

        let run = session.get_run(run_id).ok_or(CoreError::NotFound {
            kind: "workflow run",
            id: run_id.to_string(),
        })?;
        run.cancel().await;
        session.unregister_run(run_id);
        Ok(json!({"cancelled": true, "run_id": run_id}))
    }

    /// `LIST_WORKFLOWS {session_id?}`
    pub async fn list_workflows(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let runs: Vec<Value> = session.list_runs().iter().map(|run| run.to_info()).collect();
        Ok(json!({
            "workflows": session.list_workflows(),
            "runs": runs,
        }))
    }

    /// `GET_WORKFLOW {workflow_id}`
    pub async fn get_workflow_info(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let workflow_id = require_str(params, "workflow_id")?;
        let workflow = get_workflow(&session, workflow_id)?;

        let runs: Vec<Value> = session
            .list_runs()
            .iter()
            .filter(|run| run.workflow_id() == workflow_id)
            .map(|run| run.to_info())
            .collect();

        Ok(json!({"workflow_id": workflow.id(), "runs": runs}))
    }
}
