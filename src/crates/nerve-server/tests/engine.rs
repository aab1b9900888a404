//! Engine integration tests driving wire commands end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use nerve_server::protocols::{Event, EventSink};
use nerve_server::{Command, CommandResult, CommandType, Engine, EngineConfig};

/// Sink that records every event for assertions.
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn event_types(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event_type.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

fn engine_with_sink(history_dir: &TempDir) -> (Arc<Engine>, Arc<RecordingSink>) {
    let sink = RecordingSink::new();
    let engine = Engine::new(
        sink.clone(),
        EngineConfig {
            server_name: "test-server".to_string(),
            history_enabled: true,
            history_base_dir: Some(history_dir.path().to_path_buf()),
        },
    );
    (engine, sink)
}

async fn run(engine: &Engine, command_type: CommandType, params: Value) -> CommandResult {
    engine
        .execute(Command::new(command_type, params).with_request_id("req"))
        .await
}

async fn create_bash_node(engine: &Engine, node_id: &str) {
    let result = run(
        engine,
        CommandType::CreateNode,
        json!({"node_id": node_id, "node_type": "bash"}),
    )
    .await;
    assert!(result.success, "create_node failed: {:?}", result.error);
}

#[tokio::test]
async fn single_echo_through_bash_node() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    create_bash_node(&engine, "b").await;

    let result = run(
        &engine,
        CommandType::ExecuteInput,
        json!({"node_id": "b", "text": "echo hello"}),
    )
    .await;

    assert!(result.success);
    let response = &result.data.unwrap()["response"];
    assert_eq!(response["success"], true);
    assert_eq!(response["stdout"], "hello\n");
    assert_eq!(response["exit_code"], 0);
    assert_eq!(result.request_id.as_deref(), Some("req"));
}

#[tokio::test]
async fn interrupt_bash_mid_execution() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);
    create_bash_node(&engine, "sleeper").await;

    let exec_engine = engine.clone();
    let task = tokio::spawn(async move {
        run(
            &exec_engine,
            CommandType::ExecuteInput,
            json!({"node_id": "sleeper", "text": "sleep 100"}),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let interrupt = run(
        &engine,
        CommandType::InterruptNode,
        json!({"node_id": "sleeper"}),
    )
    .await;
    assert!(interrupt.success);

    let result = task.await.unwrap();
    assert!(result.success);
    let response = &result.data.unwrap()["response"];
    assert_eq!(response["interrupted"], true);
}

#[tokio::test]
async fn two_step_graph_with_template() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    // Both nodes print their input via echo.
    create_bash_node(&engine, "pick").await;
    create_bash_node(&engine, "double").await;

    let result = run(
        &engine,
        CommandType::ExecuteGraph,
        json!({
            "graph_id": "pipeline",
            "steps": [
                {"step_id": "a", "node_id": "pick", "input": "echo 7"},
                {"step_id": "b", "node_id": "double", "input": "echo \"Double: {a}\"", "depends_on": ["a"]},
            ],
        }),
    )
    .await;

    assert!(result.success, "graph failed: {:?}", result.error);
    let response = &result.data.unwrap()["response"];
    assert_eq!(response["success"], true);

    let steps = &response["attributes"]["step_results"];
    assert_eq!(steps["a"]["output"], "7\n");
    assert_eq!(steps["b"]["output"], "Double: 7\n\n");
}

#[tokio::test]
async fn graph_cycle_is_rejected_at_creation() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);
    create_bash_node(&engine, "n").await;

    let result = run(
        &engine,
        CommandType::CreateGraph,
        json!({
            "graph_id": "loopy",
            "steps": [
                {"step_id": "x", "node_id": "n", "depends_on": ["y"]},
                {"step_id": "y", "node_id": "n", "depends_on": ["x"]},
            ],
        }),
    )
    .await;

    assert!(!result.success);
    assert!(result.error.unwrap().to_lowercase().contains("cycle"));

    // The half-built graph did not stay registered.
    let list = run(&engine, CommandType::ListGraphs, json!({})).await;
    assert_eq!(list.data.unwrap()["graphs"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn workflow_with_gate_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine_with_sink(&dir);

    let registered = run(
        &engine,
        CommandType::RegisterWorkflow,
        json!({
            "workflow_id": "approve",
            "steps": [
                {"kind": "gate", "prompt": "continue?", "choices": ["y", "n"]},
            ],
        }),
    )
    .await;
    assert!(registered.success, "{:?}", registered.error);

    let started = run(
        &engine,
        CommandType::RunWorkflow,
        json!({"workflow_id": "approve"}),
    )
    .await;
    assert!(started.success);
    let run_id = started.data.unwrap()["run_id"].as_str().unwrap().to_string();

    // Wait for the gate_waiting event to land.
    let mut gate_seen = false;
    for _ in 0..100 {
        if sink.event_types().iter().any(|t| t == "gate_waiting") {
            gate_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gate_seen, "gate_waiting never emitted");
    let gate_event = sink
        .events
        .lock()
        .iter()
        .find(|e| e.event_type == "gate_waiting")
        .cloned()
        .unwrap();
    assert_eq!(gate_event.data["data"]["choices"], json!(["y", "n"]));

    // An answer outside the choices is rejected as InvalidParams.
    let invalid = run(
        &engine,
        CommandType::AnswerGate,
        json!({"run_id": run_id, "answer": "maybe"}),
    )
    .await;
    assert!(!invalid.success);
    assert_eq!(invalid.data.unwrap()["error_type"], "InvalidParams");

    let answered = run(
        &engine,
        CommandType::AnswerGate,
        json!({"run_id": run_id, "answer": "n"}),
    )
    .await;
    assert!(answered.success, "{:?}", answered.error);

    // The run completes with the chosen answer as its result.
    let mut completed = None;
    for _ in 0..100 {
        completed = sink
            .events
            .lock()
            .iter()
            .find(|e| e.event_type == "workflow_completed")
            .cloned();
        if completed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let completed = completed.expect("workflow_completed never emitted");
    assert_eq!(completed.data["data"]["result"], "n");
}

#[tokio::test]
async fn duplicate_node_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);
    create_bash_node(&engine, "dup").await;

    let result = run(
        &engine,
        CommandType::CreateNode,
        json!({"node_id": "dup", "node_type": "bash"}),
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.data.unwrap()["error_type"], "DuplicateId");
}

#[tokio::test]
async fn invalid_node_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    let result = run(
        &engine,
        CommandType::CreateNode,
        json!({"node_id": "bad name!", "node_type": "bash"}),
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.data.unwrap()["error_type"], "InvalidName");
}

#[tokio::test]
async fn get_history_returns_entries_and_is_graceful() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    // Terminal nodes record history; drive one write through the engine.
    let created = run(
        &engine,
        CommandType::CreateNode,
        json!({"node_id": "term", "node_type": "pty", "command": "sh"}),
    )
    .await;
    assert!(created.success, "{:?}", created.error);

    let wrote = run(
        &engine,
        CommandType::WriteRaw,
        json!({"node_id": "term", "data": "echo hi\n"}),
    )
    .await;
    assert!(wrote.success);

    let history = run(
        &engine,
        CommandType::GetHistory,
        json!({"node_id": "term", "op": "write"}),
    )
    .await;
    assert!(history.success);
    let data = history.data.unwrap();
    assert_eq!(data["server_name"], "test-server");
    assert!(data["total"].as_u64().unwrap() >= 1);
    for entry in data["entries"].as_array().unwrap() {
        assert_eq!(entry["op"], "write");
    }

    // Unknown node: graceful empty result, not an error.
    let missing = run(
        &engine,
        CommandType::GetHistory,
        json!({"node_id": "nonexistent"}),
    )
    .await;
    assert!(missing.success);
    let data = missing.data.unwrap();
    assert_eq!(data["total"], 0);
    assert!(data["note"].is_string());

    run(&engine, CommandType::DeleteNode, json!({"node_id": "term"})).await;
}

#[tokio::test]
async fn get_history_requires_node_id() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    let result = run(&engine, CommandType::GetHistory, json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("node_id"));
}

#[tokio::test]
async fn session_commands_round_trip() {
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine_with_sink(&dir);

    let created = run(
        &engine,
        CommandType::CreateSession,
        json!({"session_id": "work", "description": "scratch", "tags": ["t1"]}),
    )
    .await;
    assert!(created.success);

    let list = run(&engine, CommandType::ListSessions, json!({})).await;
    let sessions = list.data.unwrap()["sessions"].as_array().unwrap().len();
    assert_eq!(sessions, 2);

    // Nodes land in the addressed session, not the default one.
    let result = run(
        &engine,
        CommandType::CreateNode,
        json!({"node_id": "b", "node_type": "bash", "session_id": "work"}),
    )
    .await;
    assert!(result.success);

    let default_nodes = run(&engine, CommandType::ListNodes, json!({})).await;
    assert_eq!(
        default_nodes.data.unwrap()["nodes"].as_array().unwrap().len(),
        0
    );
    let work_nodes = run(
        &engine,
        CommandType::ListNodes,
        json!({"session_id": "work"}),
    )
    .await;
    assert_eq!(work_nodes.data.unwrap()["nodes"].as_array().unwrap().len(), 1);

    let deleted = run(
        &engine,
        CommandType::DeleteSession,
        json!({"session_id": "work"}),
    )
    .await;
    assert!(deleted.success);
    assert!(sink.event_types().contains(&"SESSION_DELETED".to_string()));
}

#[tokio::test]
async fn node_events_are_emitted() {
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine_with_sink(&dir);

    create_bash_node(&engine, "evented").await;
    let result = run(
        &engine,
        CommandType::DeleteNode,
        json!({"node_id": "evented"}),
    )
    .await;
    assert!(result.success);

    let types = sink.event_types();
    assert!(types.contains(&"NODE_CREATED".to_string()));
    assert!(types.contains(&"NODE_DELETED".to_string()));
}

#[tokio::test]
async fn shutdown_flips_the_signal() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    assert!(!engine.shutdown_requested());
    let result = run(&engine, CommandType::Shutdown, json!({})).await;
    assert!(result.success);
    assert!(engine.shutdown_requested());

    engine.shutdown().await;
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine_with_sink(&dir);

    let result = run(
        &engine,
        CommandType::ListNodes,
        json!({"session_id": "ghost"}),
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.data.unwrap()["error_type"], "NotFound");
}
