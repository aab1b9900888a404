//! Graph commands: create, execute, run, cancel, inspect.
//!
//! Wire-side step definitions carry string inputs that may contain
//! `{step_id}` placeholders; those compile to input functions that pull the
//! referenced step's `output` from the upstream map at dispatch time.

use std::collections::HashMap;
use std::sync::Arc;

use nerve_core::graph::{Graph, InputFn, Step, StepEvent, StepEventType};
use nerve_core::node::ExecutionContext;
use nerve_core::{CoreError, Session};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{Result, ServerError};
use crate::protocols::{Event, EventSink, EventType};
use crate::session_registry::SessionRegistry;
use crate::validation::{get_graph, optional_str, require_str};

pub struct GraphHandler {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
    template_re: Regex,
    running: Mutex<HashMap<String, tokio::task::JoinHandle<Result<Value>>>>,
}

/// Substitute `{step_id}` placeholders with `upstream[step_id]["output"]`.
///
/// Total on strings whose placeholders all resolve; a missing step id is an
/// error. Idempotent on strings without placeholders.
pub fn substitute_template(
    re: &Regex,
    template: &str,
    upstream: &HashMap<String, Value>,
) -> std::result::Result<String, CoreError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let step_id = &caps[1];
        let value = upstream
            .get(step_id)
            .ok_or_else(|| CoreError::UnknownStepReference(step_id.to_string()))?;
        let output = match value.get("output") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&output);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

impl GraphHandler {
    pub fn new(registry: Arc<SessionRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            sink,
            template_re: Regex::new(r"\{(\w+)\}").expect("template regex"),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn template_input_fn(&self, template: String) -> InputFn {
        let re = self.template_re.clone();
        Arc::new(move |upstream| {
            substitute_template(&re, &template, upstream).map(Value::String)
        })
    }

    /// Add one wire-format step definition to a graph.
    ///
    /// Step format: `{step_id, node_id, input?, depends_on?}` where `input`
    /// may contain `{step_id}` templates.
    fn add_step_from_value(
        &self,
        graph: &Arc<Graph>,
        session: &Arc<Session>,
        step_data: &Value,
    ) -> Result<()> {
        let step_id = step_data
            .get("step_id")
            .or_else(|| step_data.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ServerError::InvalidParams("step missing 'step_id'".into()))?;
        let node_id = step_data
            .get("node_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServerError::InvalidParams("step missing 'node_id'".into()))?;

        if session.get_node(node_id).is_none() {
            return Err(CoreError::NotFound {
                kind: "node",
                id: node_id.to_string(),
            }
            .into());
        }

        let mut step = Step::node_ref(node_id);

        let input = step_data
            .get("input")
            .or_else(|| step_data.get("text"))
            .cloned()
            .unwrap_or(Value::String(String::new()));
        match &input {
            Value::String(text) if self.template_re.is_match(text) => {
                step = step.with_input_fn(self.template_input_fn(text.clone()));
            }
            other => {
                step = step.with_input(other.clone());
            }
        }

        if let Some(deps) = step_data.get("depends_on") {
            let deps = deps
                .as_array()
                .ok_or_else(|| ServerError::InvalidParams("'depends_on' must be a list".into()))?;
            step = step.after(deps.iter().filter_map(Value::as_str).map(str::to_string));
        }

        graph.add_step(step_id, step)?;
        Ok(())
    }

    /// `CREATE_GRAPH {graph_id, session_id?, steps?}`
    pub async fn create_graph(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let graph_id = require_str(params, "graph_id")?;

        let graph = Graph::create(graph_id, &session)?;

        if let Some(steps) = params.get("steps").filter(|v| !v.is_null()) {
            let steps = steps
                .as_array()
                .ok_or_else(|| ServerError::InvalidParams("'steps' must be a list".into()))?;

            let added: Result<()> = steps.iter().enumerate().try_for_each(|(i, step_data)| {
                self.add_step_from_value(&graph, &session, step_data)
                    .map_err(|e| {
                        ServerError::InvalidParams(format!(
                            "step {i} ('{}'): {e}",
                            step_data
                                .get("step_id")
                                .and_then(Value::as_str)
                                .unwrap_or("?")
                        ))
                    })
            });

            let validated = added.and_then(|_| {
                let errors = graph.validate();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(CoreError::GraphValidation(errors.join("; ")).into())
                }
            });

            // A graph that failed construction must not linger registered.
            if let Err(e) = validated {
                session.delete_graph(graph_id);
                return Err(e);
            }
        }

        self.sink
            .emit(Event::new(
                EventType::GraphCreated,
                None,
                json!({"graph_id": graph_id, "step_count": graph.len()}),
            ))
            .await;

        Ok(json!({"graph_id": graph_id, "step_count": graph.len()}))
    }

    /// `DELETE_GRAPH {graph_id}`
    pub async fn delete_graph(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let graph_id = require_str(params, "graph_id")?;

        if !session.delete_graph(graph_id) {
            return Err(CoreError::NotFound {
                kind: "graph",
                id: graph_id.to_string(),
            }
            .into());
        }

        self.sink
            .emit(Event::new(
                EventType::GraphDeleted,
                None,
                json!({"graph_id": graph_id}),
            ))
            .await;
        Ok(json!({"deleted": true}))
    }

    /// `LIST_GRAPHS {session_id?}`
    pub async fn list_graphs(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let graphs: Vec<Value> = session
            .list_graphs()
            .iter()
            .filter_map(|id| session.get_graph(id))
            .map(|graph| json!({"id": graph.id(), "step_count": graph.len()}))
            .collect();
        Ok(json!({"graphs": graphs}))
    }

    /// `GET_GRAPH {graph_id}`
    pub async fn get_graph_info(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let graph_id = require_str(params, "graph_id")?;
        let graph = get_graph(&session, graph_id)?;

        let steps: Vec<Value> = graph
            .list_steps()
            .iter()
            .filter_map(|id| graph.get_step(id).map(|step| (id.clone(), step)))
            .map(|(id, step)| {
                let node_id = step
                    .node_ref
                    .clone()
                    .or_else(|| step.node.as_ref().map(|n| n.id().to_string()));
                json!({
                    "id": id,
                    "node_id": node_id,
                    "input": step.input,
                    "depends_on": step.depends_on,
                })
            })
            .collect();

        Ok(json!({"graph_id": graph_id, "steps": steps}))
    }

    /// `EXECUTE_GRAPH {graph_id?, steps, session_id?, input?}` - build a
    /// graph from inline step definitions and execute it, streaming step
    /// events to all clients.
    pub async fn execute_graph(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let graph_id = optional_str(params, "graph_id").unwrap_or("graph_0").to_string();

        let steps = params
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ServerError::InvalidParams(
                    "missing or invalid 'steps'; expected a list of step definitions".into(),
                )
            })?;

        let graph = Graph::create(&graph_id, &session)?;
        let built: Result<()> = steps
            .iter()
            .try_for_each(|step_data| self.add_step_from_value(&graph, &session, step_data));
        if let Err(e) = built {
            session.delete_graph(&graph_id);
            return Err(e);
        }

        let ctx = ExecutionContext::new(session.clone())
            .with_input(params.get("input").cloned().unwrap_or(Value::Null));
        let result = self.drive_graph(&graph, ctx).await;

        // Inline graphs are transient; drop the registration either way.
        session.delete_graph(&graph_id);
        result.map(|value| json!({"graph_id": graph_id, "response": value}))
    }

    /// `RUN_GRAPH {graph_id, input?}` - execute a pre-registered graph.
    pub async fn run_graph(&self, params: &Value) -> Result<Value> {
        let session = self.registry.get(optional_str(params, "session_id"))?;
        let graph_id = require_str(params, "graph_id")?;
        let graph = get_graph(&session, graph_id)?;

        let ctx = ExecutionContext::new(session)
            .with_input(params.get("input").cloned().unwrap_or(Value::Null));

        let value = self.drive_graph(&graph, ctx).await?;
        Ok(json!({"response": value}))
    }

    /// Execute a graph in a cancellable task, forwarding step events to the
    /// event sink as they happen.
    async fn drive_graph(&self, graph: &Arc<Graph>, ctx: ExecutionContext) -> Result<Value> {
        let graph_id = graph.id().to_string();

        self.sink
            .emit(Event::new(
                EventType::GraphStarted,
                None,
                json!({"graph_id": graph_id}),
            ))
            .await;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StepEvent>();

        let exec_graph = Arc::clone(graph);
        let task = tokio::spawn(async move {
            exec_graph
                .execute_with_events(ctx, event_tx)
                .await
                .map_err(ServerError::from)
        });
        self.running.lock().insert(graph_id.clone(), task);

        while let Some(step_event) = event_rx.recv().await {
            let event_type = match step_event.event_type {
                StepEventType::StepStart => EventType::StepStarted,
                StepEventType::StepComplete => EventType::StepCompleted,
                StepEventType::StepError => EventType::StepFailed,
            };
            self.sink
                .emit(Event::new(
                    event_type,
                    step_event.node_id.clone(),
                    json!({
                        "graph_id": graph_id,
                        "step_id": step_event.step_id,
                        "data": step_event.data,
                    }),
                ))
                .await;
        }

        let task = self.running.lock().remove(&graph_id);
        let outcome = match task {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(CoreError::Cancelled.into()),
                Err(e) => Err(ServerError::InvalidParams(format!("graph task failed: {e}"))),
            },
            // Cancelled out from under us by CANCEL_GRAPH.
            None => Err(CoreError::Cancelled.into()),
        };

        let (success, error) = match &outcome {
            Ok(value) => (
                value.get("success").and_then(Value::as_bool).unwrap_or(false),
                value.get("error").cloned(),
            ),
            Err(e) => (false, Some(json!(e.to_string()))),
        };
        self.sink
            .emit(Event::new(
                EventType::GraphCompleted,
                None,
                json!({"graph_id": graph_id, "success": success, "error": error}),
            ))
            .await;

        outcome
    }

    /// `CANCEL_GRAPH {graph_id}`
    pub async fn cancel_graph(&self, params: &Value) -> Result<Value> {
        let graph_id = require_str(params, "graph_id")?;

        let task = self.running.lock().remove(graph_id);
        match task {
            Some(task) => {
                task.abort();
                Ok(json!({"cancelled": true}))
            }
            None => Ok(json!({"cancelled": false, "error": "Graph not running"})),
        }
    }

    /// Number of graphs currently executing.
    pub fn running_graph_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Abort every running graph (server shutdown).
    pub fn cancel_all(&self) {
        for (_, task) in self.running.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn re() -> Regex {
        Regex::new(r"\{(\w+)\}").unwrap()
    }

    fn upstream_with(step: &str, output: &str) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(step.to_string(), json!({"output": output}));
        map
    }

    #[test]
    fn substitutes_step_output() {
        let upstream = upstream_with("pick", "7\n");
        let out = substitute_template(&re(), "Double this: {pick}", &upstream).unwrap();
        assert_eq!(out, "Double this: 7\n");
    }

    #[test]
    fn unknown_step_reference_errors() {
        let upstream = upstream_with("a", "1");
        let err = substitute_template(&re(), "{missing}", &upstream).unwrap_err();
        assert!(matches!(err, CoreError::UnknownStepReference(_)));
        assert_eq!(err.error_type(), "UnknownStepReference");
        assert!(err.to_string().contains("unknown step: missing"));
    }

    #[test]
    fn non_dict_results_fall_back_to_display() {
        let mut upstream = HashMap::new();
        upstream.insert("n".to_string(), json!(42));
        let out = substitute_template(&re(), "got {n}", &upstream).unwrap();
        assert_eq!(out, "got 42");
    }

    proptest! {
        /// Substitution is idempotent on strings without placeholders.
        #[test]
        fn idempotent_without_placeholders(text in "[a-zA-Z0-9 .,!?]*") {
            let upstream = HashMap::new();
            let once = substitute_template(&re(), &text, &upstream).unwrap();
            let twice = substitute_template(&re(), &once, &upstream).unwrap();
            prop_assert_eq!(&once, &text);
            prop_assert_eq!(once, twice);
        }

        /// Substitution is total when every placeholder resolves.
        #[test]
        fn total_when_placeholders_resolve(output in "[a-z0-9]*") {
            let upstream = upstream_with("a", &output);
            let out = substitute_template(&re(), "pre {a} post", &upstream).unwrap();
            prop_assert_eq!(out, format!("pre {output} post"));
        }
    }
}
