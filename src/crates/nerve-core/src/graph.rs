//! Declarative DAG execution.
//!
//! A graph is an ordered set of steps, each invoking one node (directly or
//! by id resolved against the session at dispatch time). Execution is
//! dependency-ordered and concurrent: every step whose dependencies have
//! completed is dispatched immediately, and independent steps overlap.
//!
//! Graphs implement [`Node`], so a step may itself be a graph; the nested
//! result is the inner step-results map.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::node::{ExecutionContext, Node, NodeInfo, NodeState};
use crate::parser::ParserKind;
use crate::session::Session;

/// How a step failure affects the rest of the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Cancel all outstanding steps and fail the graph (default).
    #[default]
    FailFast,
    /// Record the failure in `step_results` and keep going; dependents see
    /// the failed result in their `upstream`.
    Continue,
}

/// Input resolver taking the upstream results map.
pub type InputFn = Arc<dyn Fn(&HashMap<String, Value>) -> Result<Value> + Send + Sync>;

/// One node invocation within a graph.
#[derive(Clone, Default)]
pub struct Step {
    /// Direct node reference. Exactly one of `node` / `node_ref` is set.
    pub node: Option<Arc<dyn Node>>,
    /// Node id resolved against the session at execution time.
    pub node_ref: Option<String>,
    /// Static input. Mutually exclusive with `input_fn`.
    pub input: Option<Value>,
    /// Input computed from upstream results at dispatch.
    pub input_fn: Option<InputFn>,
    /// Step ids this step waits for.
    pub depends_on: Vec<String>,
    pub error_policy: Option<ErrorPolicy>,
    /// Parser override for terminal nodes.
    pub parser: Option<ParserKind>,
}

impl Step {
    pub fn node(node: Arc<dyn Node>) -> Self {
        Self {
            node: Some(node),
            ..Default::default()
        }
    }

    pub fn node_ref(node_id: impl Into<String>) -> Self {
        Self {
            node_ref: Some(node_id.into()),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_input_fn(mut self, f: InputFn) -> Self {
        self.input_fn = Some(f);
        self
    }

    pub fn after<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    pub fn with_parser(mut self, parser: ParserKind) -> Self {
        self.parser = Some(parser);
        self
    }
}

/// Event emitted while a graph executes.
#[derive(Debug, Clone, Serialize)]
pub struct StepEvent {
    pub event_type: StepEventType,
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventType {
    StepStart,
    StepComplete,
    StepError,
}

impl StepEvent {
    fn new(event_type: StepEventType, step_id: &str, node_id: Option<String>, data: Option<Value>) -> Self {
        Self {
            event_type,
            step_id: step_id.to_string(),
            node_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct StepMap {
    order: Vec<String>,
    steps: HashMap<String, Step>,
}

/// Declarative acyclic pipeline owned by a session.
pub struct Graph {
    id: String,
    session_id: String,
    steps: RwLock<StepMap>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Graph {
    /// Create and register an empty graph in `session`.
    pub fn create(id: &str, session: &Arc<Session>) -> Result<Arc<Self>> {
        let graph = Arc::new(Self {
            id: id.to_string(),
            session_id: session.id.clone(),
            steps: RwLock::new(StepMap::default()),
        });
        session.register_graph(graph.clone())?;
        Ok(graph)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.steps.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a step before execution.
    pub fn add_step(&self, step_id: &str, step: Step) -> Result<()> {
        if step_id.is_empty() {
            return Err(CoreError::GraphValidation("step id cannot be empty".into()));
        }
        let mut map = self.steps.write();
        if map.steps.contains_key(step_id) {
            return Err(CoreError::GraphValidation(format!(
                "step '{step_id}' already exists"
            )));
        }
        map.order.push(step_id.to_string());
        map.steps.insert(step_id.to_string(), step);
        Ok(())
    }

    /// Chain steps in sequence: each later step depends on the previous.
    pub fn chain(&self, step_ids: &[&str]) -> Result<()> {
        let mut map = self.steps.write();
        for id in step_ids {
            if !map.steps.contains_key(*id) {
                return Err(CoreError::GraphValidation(format!("unknown step '{id}'")));
            }
        }
        for pair in step_ids.windows(2) {
            let (prev, next) = (pair[0].to_string(), pair[1]);
            let step = map.steps.get_mut(next).expect("checked above");
            if !step.depends_on.contains(&prev) {
                step.depends_on.push(prev);
            }
        }
        Ok(())
    }

    pub fn list_steps(&self) -> Vec<String> {
        self.steps.read().order.clone()
    }

    pub fn get_step(&self, step_id: &str) -> Option<Step> {
        self.steps.read().steps.get(step_id).cloned()
    }

    /// Structural validation. Returns every problem found; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let map = self.steps.read();
        let mut errors = Vec::new();

        for id in &map.order {
            let step = &map.steps[id];

            match (&step.node, &step.node_ref) {
                (None, None) => errors.push(format!("step '{id}' has neither node nor node_ref")),
                (Some(_), Some(_)) => {
                    errors.push(format!("step '{id}' has both node and node_ref"))
                }
                _ => {}
            }

            if step.input.is_some() && step.input_fn.is_some() {
                errors.push(format!(
                    "step '{id}': input and input_fn are mutually exclusive"
                ));
            }

            for dep in &step.depends_on {
                if dep == id {
                    errors.push(format!("step '{id}' depends on itself"));
                } else if !map.steps.contains_key(dep) {
                    errors.push(format!("step '{id}' depends on unknown step '{dep}'"));
                }
            }
        }

        // Cycle detection via Kahn's algorithm over the valid edges.
        let mut indegree: HashMap<&str, usize> =
            map.order.iter().map(|id| (id.as_str(), 0)).collect();
        for (id, step) in &map.steps {
            for dep in &step.depends_on {
                if dep != id && map.steps.contains_key(dep) {
                    *indegree.get_mut(id.as_str()).expect("known step") += 1;
                }
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for (other, step) in &map.steps {
                if step.depends_on.iter().any(|d| d.as_str() == id) && other.as_str() != id {
                    let deg = indegree.get_mut(other.as_str()).expect("known step");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(other.as_str());
                    }
                }
            }
        }
        if visited < map.order.len() {
            errors.push("dependency cycle detected among steps".to_string());
        }

        errors
    }

    /// One valid topological ordering of the steps.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(CoreError::GraphValidation(errors.join("; ")));
        }

        let map = self.steps.read();
        let mut remaining: HashSet<&str> = map.order.iter().map(String::as_str).collect();
        let mut order = Vec::with_capacity(map.order.len());

        while !remaining.is_empty() {
            let next: Vec<&str> = map
                .order
                .iter()
                .map(String::as_str)
                .filter(|id| {
                    remaining.contains(id)
                        && map.steps[*id]
                            .depends_on
                            .iter()
                            .all(|dep| !remaining.contains(dep.as_str()))
                })
                .collect();
            debug_assert!(!next.is_empty(), "validated graph cannot stall");
            for id in next {
                remaining.remove(id);
                order.push(id.to_string());
            }
        }
        Ok(order)
    }

    /// Transitive dependency closure per step.
    fn transitive_deps(map: &StepMap) -> HashMap<String, HashSet<String>> {
        let mut closure: HashMap<String, HashSet<String>> = HashMap::new();
        for id in &map.order {
            let mut seen = HashSet::new();
            let mut stack: Vec<&String> = map.steps[id].depends_on.iter().collect();
            while let Some(dep) = stack.pop() {
                if seen.insert(dep.clone()) {
                    if let Some(step) = map.steps.get(dep) {
                        stack.extend(step.depends_on.iter());
                    }
                }
            }
            closure.insert(id.clone(), seen);
        }
        closure
    }

    /// Execute all steps; returns the standard result envelope
    /// `{success, output, error, attributes: {step_results}}`.
    pub async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        let (success, error, results) = self.run(ctx, None).await?;
        Ok(self.envelope(success, error, results))
    }

    /// Execute while streaming [`StepEvent`]s to `events`.
    pub async fn execute_with_events(
        &self,
        ctx: ExecutionContext,
        events: mpsc::UnboundedSender<StepEvent>,
    ) -> Result<Value> {
        let (success, error, results) = self.run(ctx, Some(events)).await?;
        Ok(self.envelope(success, error, results))
    }

    /// Execute and yield events as a stream; the result envelope is dropped.
    pub fn execute_stream(
        self: &Arc<Self>,
        ctx: ExecutionContext,
    ) -> impl futures::Stream<Item = StepEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let graph = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = graph.execute_with_events(ctx, tx).await {
                warn!(graph_id = %graph.id, error = %e, "graph stream execution failed");
            }
        });
        tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
    }

    fn envelope(&self, success: bool, error: Option<String>, results: HashMap<String, Value>) -> Value {
        let map = self.steps.read();
        // The overall output is the unique sink's result when exactly one
        // step has no dependents.
        let dependents: HashSet<&String> = map
            .steps
            .values()
            .flat_map(|s| s.depends_on.iter())
            .collect();
        let sinks: Vec<&String> = map.order.iter().filter(|id| !dependents.contains(id)).collect();

        let step_results = Value::Object(results.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        let output = if sinks.len() == 1 {
            results.get(sinks[0].as_str()).cloned().unwrap_or(Value::Null)
        } else {
            step_results.clone()
        };

        json!({
            "success": success,
            "output": output,
            "error": error,
            "attributes": {"step_results": step_results},
        })
    }

    async fn run(
        &self,
        ctx: ExecutionContext,
        events: Option<mpsc::UnboundedSender<StepEvent>>,
    ) -> Result<(bool, Option<String>, HashMap<String, Value>)> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(CoreError::GraphValidation(errors.join("; ")));
        }

        let snapshot = {
            let map = self.steps.read();
            StepMap {
                order: map.order.clone(),
                steps: map.steps.clone(),
            }
        };

        let closure = Self::transitive_deps(&snapshot);

        let mut indegree: HashMap<String, usize> = snapshot
            .order
            .iter()
            .map(|id| (id.clone(), snapshot.steps[id].depends_on.len()))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (id, step) in &snapshot.steps {
            for dep in &step.depends_on {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        let emit = |event: StepEvent| {
            if let Some(tx) = &events {
                let _ = tx.send(event);
            }
        };

        let mut ready: VecDeque<String> = snapshot
            .order
            .iter()
            .filter(|id| indegree[*id] == 0)
            .cloned()
            .collect();

        let mut results: HashMap<String, Value> = HashMap::new();
        let mut tasks: JoinSet<(String, Result<Value>)> = JoinSet::new();
        let mut completed = 0usize;
        let total = snapshot.order.len();
        let mut fatal: Option<String> = None;

        'outer: while completed < total {
            // Dispatch everything currently ready.
            while let Some(step_id) = ready.pop_front() {
                let step = snapshot.steps[&step_id].clone();

                let node = match (&step.node, &step.node_ref) {
                    (Some(node), _) => Arc::clone(node),
                    (None, Some(node_ref)) => match ctx.session.get_node(node_ref) {
                        Some(node) => node,
                        None => {
                            let message = format!("node not found: {node_ref}");
                            emit(StepEvent::new(
                                StepEventType::StepError,
                                &step_id,
                                Some(node_ref.clone()),
                                Some(json!({"error": message})),
                            ));
                            fatal = Some(message);
                            break 'outer;
                        }
                    },
                    (None, None) => unreachable!("validated"),
                };

                // Property: upstream carries exactly the transitive deps.
                let upstream: HashMap<String, Value> = closure[&step_id]
                    .iter()
                    .filter_map(|dep| results.get(dep).map(|v| (dep.clone(), v.clone())))
                    .collect();

                let input = if let Some(f) = &step.input_fn {
                    match f(&upstream) {
                        Ok(value) => value,
                        Err(e) => {
                            let message = format!("input resolution failed: {e}");
                            emit(StepEvent::new(
                                StepEventType::StepError,
                                &step_id,
                                Some(node.id().to_string()),
                                Some(json!({"error": message})),
                            ));
                            if step.error_policy == Some(ErrorPolicy::Continue) {
                                results.insert(
                                    step_id.clone(),
                                    json!({"success": false, "error": message, "output": ""}),
                                );
                                completed += 1;
                                for dependent in dependents.get(&step_id).into_iter().flatten() {
                                    let deg = indegree.get_mut(dependent).expect("known");
                                    *deg -= 1;
                                    if *deg == 0 {
                                        ready.push_back(dependent.clone());
                                    }
                                }
                                continue;
                            }
                            fatal = Some(message);
                            break 'outer;
                        }
                    }
                } else if let Some(value) = &step.input {
                    value.clone()
                } else {
                    ctx.input.clone()
                };

                emit(StepEvent::new(
                    StepEventType::StepStart,
                    &step_id,
                    Some(node.id().to_string()),
                    None,
                ));

                let step_ctx = ctx
                    .clone()
                    .with_input(input)
                    .with_upstream(upstream)
                    .with_parser(step.parser.or(ctx.parser));

                let task_node = Arc::clone(&node);
                let task_id = step_id.clone();
                tasks.spawn(async move {
                    let result = task_node.execute(step_ctx).await;
                    (task_id, result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                // Validation guarantees progress; reaching here means every
                // remaining step errored out of the ready queue.
                break;
            };

            let (step_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    if e.is_cancelled() {
                        fatal = Some("cancelled".into());
                        break;
                    }
                    fatal = Some(format!("step task panicked: {e}"));
                    break;
                }
            };

            let step = &snapshot.steps[&step_id];
            let node_id = step
                .node
                .as_ref()
                .map(|n| n.id().to_string())
                .or_else(|| step.node_ref.clone());

            match outcome {
                Ok(value) => {
                    debug!(graph_id = %self.id, step_id = %step_id, "step complete");
                    emit(StepEvent::new(
                        StepEventType::StepComplete,
                        &step_id,
                        node_id,
                        Some(value.clone()),
                    ));
                    results.insert(step_id.clone(), value);
                }
                Err(e) => {
                    let message = e.to_string();
                    emit(StepEvent::new(
                        StepEventType::StepError,
                        &step_id,
                        node_id,
                        Some(json!({"error": message})),
                    ));
                    if step.error_policy == Some(ErrorPolicy::Continue) {
                        results.insert(
                            step_id.clone(),
                            json!({"success": false, "error": message, "output": ""}),
                        );
                    } else {
                        tasks.abort_all();
                        fatal = Some(format!("step '{step_id}' failed: {message}"));
                        break;
                    }
                }
            }

            completed += 1;
            for dependent in dependents.get(&step_id).into_iter().flatten() {
                let deg = indegree.get_mut(dependent).expect("known");
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(dependent.clone());
                }
            }
        }

        let success = fatal.is_none() && completed == total;
        Ok((success, fatal, results))
    }
}

#[async_trait]
impl Node for Graph {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "graph"
    }

    fn state(&self) -> NodeState {
        NodeState::Ready
    }

    /// Nested execution: the result is the inner step-results map.
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        let (success, error, results) = self.run(ctx, None).await?;
        if !success {
            return Err(CoreError::Execution(
                error.unwrap_or_else(|| "graph execution failed".into()),
            ));
        }
        Ok(Value::Object(results.into_iter().collect()))
    }

    async fn stop(&self) {}

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: "graph".into(),
            state: NodeState::Ready,
            persistent: false,
            metadata: json!({"steps": self.len()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FunctionNode;
    use futures::StreamExt;

    fn echo_node(session: &Arc<Session>, id: &str) -> Arc<FunctionNode> {
        FunctionNode::create(id, session, |ctx| {
            Ok(json!({"success": true, "output": ctx.input_str()}))
        })
        .unwrap()
    }

    #[test]
    fn add_step_rejects_duplicates_and_empty_ids() {
        let session = Session::new("g-add", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        graph.add_step("a", Step::node(node.clone())).unwrap();
        assert!(graph.add_step("a", Step::node(node.clone())).is_err());
        assert!(graph.add_step("", Step::node(node)).is_err());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn chain_sets_dependencies() {
        let session = Session::new("g-chain", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        for id in ["a", "b", "c"] {
            graph.add_step(id, Step::node(node.clone())).unwrap();
        }
        graph.chain(&["a", "b", "c"]).unwrap();

        assert!(graph.get_step("b").unwrap().depends_on.contains(&"a".to_string()));
        assert!(graph.get_step("c").unwrap().depends_on.contains(&"b".to_string()));
    }

    #[test]
    fn validate_reports_all_problems() {
        let session = Session::new("g-validate", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        graph
            .add_step("selfish", Step::node(node.clone()).after(["selfish"]))
            .unwrap();
        graph
            .add_step("orphan", Step::node(node.clone()).after(["missing"]))
            .unwrap();
        graph.add_step("empty", Step::default()).unwrap();
        graph
            .add_step(
                "conflicted",
                Step::node(node)
                    .with_input(json!("x"))
                    .with_input_fn(Arc::new(|_| Ok(json!("y")))),
            )
            .unwrap();

        let errors = graph.validate();
        assert!(errors.iter().any(|e| e.contains("depends on itself")));
        assert!(errors.iter().any(|e| e.contains("unknown step")));
        assert!(errors.iter().any(|e| e.contains("neither node nor node_ref")));
        assert!(errors.iter().any(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn validate_detects_cycles() {
        let session = Session::new("g-cycle", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        graph.add_step("x", Step::node(node.clone()).after(["y"])).unwrap();
        graph.add_step("y", Step::node(node).after(["x"])).unwrap();

        let errors = graph.validate();
        assert!(errors.iter().any(|e| e.to_lowercase().contains("cycle")));
    }

    #[tokio::test]
    async fn execute_fails_on_invalid_graph() {
        let session = Session::new("g-cycle-exec", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        graph.add_step("x", Step::node(node.clone()).after(["y"])).unwrap();
        graph.add_step("y", Step::node(node).after(["x"])).unwrap();

        let ctx = ExecutionContext::new(session);
        let err = graph.execute(ctx).await.unwrap_err();
        assert!(matches!(err, CoreError::GraphValidation(_)));
        assert!(err.to_string().to_lowercase().contains("cycle"));
    }

    #[test]
    fn execution_order_respects_dependencies() {
        let session = Session::new("g-order", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        graph.add_step("c", Step::node(node.clone()).after(["b"])).unwrap();
        graph.add_step("b", Step::node(node.clone()).after(["a"])).unwrap();
        graph.add_step("a", Step::node(node)).unwrap();

        let order = graph.execution_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[tokio::test]
    async fn executes_with_upstream_results() {
        let session = Session::new("g-exec", "test");
        let graph = Graph::create("g", &session).unwrap();

        let first = FunctionNode::create("fn1", &session, |_| {
            Ok(json!({"success": true, "output": "result_a"}))
        })
        .unwrap();
        let second = FunctionNode::create("fn2", &session, |ctx| {
            let upstream = ctx.upstream.get("a").cloned().unwrap_or(Value::Null);
            Ok(json!({
                "success": true,
                "output": format!("got_{}", upstream["output"].as_str().unwrap_or("?")),
            }))
        })
        .unwrap();

        graph.add_step("a", Step::node(first)).unwrap();
        graph.add_step("b", Step::node(second).after(["a"])).unwrap();

        let ctx = ExecutionContext::new(session);
        let result = graph.execute(ctx).await.unwrap();

        assert_eq!(result["success"], true);
        let steps = &result["attributes"]["step_results"];
        assert_eq!(steps["a"]["output"], "result_a");
        assert_eq!(steps["b"]["output"], "got_result_a");
        // "b" is the unique sink, so it is the overall output.
        assert_eq!(result["output"]["output"], "got_result_a");
    }

    #[tokio::test]
    async fn static_input_and_input_fn() {
        let session = Session::new("g-input", "test");
        let graph = Graph::create("g", &session).unwrap();

        let upper = FunctionNode::create("up", &session, |ctx| {
            Ok(json!({"success": true, "output": ctx.input_str().to_uppercase()}))
        })
        .unwrap();

        graph
            .add_step("a", Step::node(upper.clone()).with_input(json!("hello")))
            .unwrap();
        graph
            .add_step(
                "b",
                Step::node(upper)
                    .after(["a"])
                    .with_input_fn(Arc::new(|upstream| {
                        let prev = upstream["a"]["output"].as_str().unwrap_or("");
                        Ok(json!(format!("{prev}-again")))
                    })),
            )
            .unwrap();

        let ctx = ExecutionContext::new(session);
        let result = graph.execute(ctx).await.unwrap();
        let steps = &result["attributes"]["step_results"];
        assert_eq!(steps["a"]["output"], "HELLO");
        assert_eq!(steps["b"]["output"], "HELLO-AGAIN");
    }

    #[tokio::test]
    async fn node_ref_resolved_against_session() {
        let session = Session::new("g-ref", "test");
        echo_node(&session, "registered");

        let graph = Graph::create("g", &session).unwrap();
        graph
            .add_step("a", Step::node_ref("registered").with_input(json!("via-ref")))
            .unwrap();

        let ctx = ExecutionContext::new(session);
        let result = graph.execute(ctx).await.unwrap();
        assert_eq!(result["attributes"]["step_results"]["a"]["output"], "via-ref");
    }

    #[tokio::test]
    async fn missing_node_ref_fails() {
        let session = Session::new("g-noref", "test");
        let graph = Graph::create("g", &session).unwrap();
        graph.add_step("a", Step::node_ref("ghost")).unwrap();

        let ctx = ExecutionContext::new(session);
        let result = graph.execute(ctx).await.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn nested_graph_result_is_step_results_map() {
        let session = Session::new("g-nested", "test");
        let inner = Graph::create("inner", &session).unwrap();
        let fn1 = FunctionNode::create("fn1", &session, |_| {
            Ok(json!({"success": true, "output": "inner_result"}))
        })
        .unwrap();
        inner.add_step("inner_step", Step::node(fn1)).unwrap();

        let outer = Graph::create("outer", &session).unwrap();
        outer.add_step("nested", Step::node(inner)).unwrap();
        let reader = FunctionNode::create("fn2", &session, |ctx| {
            let nested = &ctx.upstream["nested"];
            Ok(json!({
                "success": true,
                "output": format!("got_{}", nested["inner_step"]["output"].as_str().unwrap()),
            }))
        })
        .unwrap();
        outer.add_step("after", Step::node(reader).after(["nested"])).unwrap();

        let ctx = ExecutionContext::new(session);
        let result = outer.execute(ctx).await.unwrap();
        let steps = &result["attributes"]["step_results"];
        assert_eq!(steps["nested"]["inner_step"]["output"], "inner_result");
        assert_eq!(steps["after"]["output"], "got_inner_result");
    }

    #[tokio::test]
    async fn stream_emits_start_and_complete_per_step() {
        let session = Session::new("g-stream", "test");
        let graph = Graph::create("g", &session).unwrap();
        let node = echo_node(&session, "fn");

        graph.add_step("a", Step::node(node.clone())).unwrap();
        graph.add_step("b", Step::node(node).after(["a"])).unwrap();

        let ctx = ExecutionContext::new(session);
        let events: Vec<StepEvent> = graph.execute_stream(ctx).collect().await;

        let starts = events
            .iter()
            .filter(|e| e.event_type == StepEventType::StepStart)
            .count();
        let completes = events
            .iter()
            .filter(|e| e.event_type == StepEventType::StepComplete)
            .count();
        assert_eq!(starts, 2);
        assert_eq!(completes, 2);
    }

    #[tokio::test]
    async fn fail_fast_cancels_remaining_steps() {
        let session = Session::new("g-failfast", "test");
        let graph = Graph::create("g", &session).unwrap();

        let boom = FunctionNode::create("boom", &session, |_| {
            Err(CoreError::Execution("kaboom".into()))
        })
        .unwrap();
        let after = echo_node(&session, "after-node");

        graph.add_step("explode", Step::node(boom)).unwrap();
        graph
            .add_step("never", Step::node(after).after(["explode"]))
            .unwrap();

        let ctx = ExecutionContext::new(session);
        let result = graph.execute(ctx).await.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("kaboom"));
        assert!(result["attributes"]["step_results"].get("never").is_none());
    }

    #[tokio::test]
    async fn continue_policy_records_failure_and_proceeds() {
        let session = Session::new("g-continue", "test");
        let graph = Graph::create("g", &session).unwrap();

        let boom = FunctionNode::create("boom", &session, |_| {
            Err(CoreError::Execution("kaboom".into()))
        })
        .unwrap();
        let reader = FunctionNode::create("reader", &session, |ctx| {
            let failed = &ctx.upstream["explode"];
            Ok(json!({
                "success": true,
                "output": format!("saw success={}", failed["success"]),
            }))
        })
        .unwrap();

        graph
            .add_step(
                "explode",
                Step::node(boom).with_error_policy(ErrorPolicy::Continue),
            )
            .unwrap();
        graph
            .add_step("next", Step::node(reader).after(["explode"]))
            .unwrap();

        let ctx = ExecutionContext::new(session);
        let result = graph.execute(ctx).await.unwrap();
        assert_eq!(result["success"], true);
        let steps = &result["attributes"]["step_results"];
        assert_eq!(steps["explode"]["success"], false);
        assert_eq!(steps["next"]["output"], "saw success=false");
    }

    #[tokio::test]
    async fn independent_steps_overlap() {
        use std::time::{Duration, Instant};

        let session = Session::new("g-parallel", "test");
        let graph = Graph::create("g", &session).unwrap();

        for id in ["s1", "s2", "s3"] {
            let node = FunctionNode::create_async(&format!("{id}-node"), &session, |ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({"success": true, "output": ctx.input_str()}))
                })
            })
            .unwrap();
            graph.add_step(id, Step::node(node)).unwrap();
        }

        let ctx = ExecutionContext::new(session);
        let started = Instant::now();
        let result = graph.execute(ctx).await.unwrap();
        assert_eq!(result["success"], true);
        // Three 100ms steps overlapped: far less than 300ms sequential.
        assert!(started.elapsed() < Duration::from_millis(280));
    }
}
