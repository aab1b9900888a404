//! Workflow runtime integration tests: gates, cancellation, composition.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use nerve_core::node::FunctionNode;
use nerve_core::workflow::{Workflow, WorkflowRun, WorkflowState};
use nerve_core::{CoreError, Graph, Session, Step};

fn start_run(workflow: &Arc<Workflow>, session: &Arc<Session>, input: Value) -> Arc<WorkflowRun> {
    let run = WorkflowRun::new(workflow.clone(), input, json!({}), None, None);
    session.register_run(&run);
    run.start(session.clone()).unwrap();
    run
}

async fn wait_for_gate(run: &Arc<WorkflowRun>) {
    for _ in 0..100 {
        if run.state() == WorkflowState::Waiting {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never reached Waiting");
}

#[tokio::test]
async fn simple_workflow_completes() {
    let session = Session::new("wf-simple", "test");
    let workflow = Workflow::create("double", &session, |ctx| async move {
        Ok(json!(format!("{}{}", ctx.input.as_str().unwrap(), ctx.input.as_str().unwrap())))
    })
    .unwrap();

    let run = start_run(&workflow, &session, json!("ab"));
    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("abab"));
    assert_eq!(run.state(), WorkflowState::Completed);

    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"workflow_started".to_string()));
    assert!(events.contains(&"workflow_completed".to_string()));
}

#[tokio::test]
async fn failing_workflow_reports_error() {
    let session = Session::new("wf-fail", "test");
    let workflow = Workflow::create("broken", &session, |_ctx| async move {
        Err::<Value, _>(CoreError::Execution("deliberate".into()))
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    let err = run.wait().await.unwrap_err();
    assert!(err.to_string().contains("deliberate"));
    assert_eq!(run.state(), WorkflowState::Failed);
    assert_eq!(run.error().as_deref(), Some("deliberate"));
}

#[tokio::test]
async fn gate_suspends_until_answered() {
    let session = Session::new("wf-gate", "test");
    let workflow = Workflow::create("asker", &session, |ctx| async move {
        let answer = ctx
            .gate("continue?", None, Some(vec!["y".into(), "n".into()]))
            .await?;
        Ok(json!(answer))
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    wait_for_gate(&run).await;

    // Exactly one gate pending while Waiting.
    let gate = run.pending_gate().expect("gate pending");
    assert_eq!(gate.prompt, "continue?");
    assert_eq!(gate.choices.as_deref(), Some(&["y".to_string(), "n".to_string()][..]));

    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"gate_waiting".to_string()));

    run.answer_gate("n").unwrap();
    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("n"));
    assert!(run.pending_gate().is_none());

    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"gate_answered".to_string()));
}

#[tokio::test]
async fn gate_rejects_invalid_choice() {
    let session = Session::new("wf-gate-choice", "test");
    let workflow = Workflow::create("asker", &session, |ctx| async move {
        let answer = ctx
            .gate("pick", None, Some(vec!["a".into(), "b".into()]))
            .await?;
        Ok(json!(answer))
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    wait_for_gate(&run).await;

    let err = run.answer_gate("maybe").unwrap_err();
    assert!(err.to_string().contains("Invalid choice"));
    // Gate survives a bad answer.
    assert!(run.pending_gate().is_some());

    run.answer_gate("a").unwrap();
    assert_eq!(run.wait().await.unwrap(), json!("a"));
}

#[tokio::test]
async fn answer_without_gate_errors() {
    let session = Session::new("wf-nogate", "test");
    let workflow = Workflow::create("plain", &session, |_ctx| async move { Ok(json!(1)) }).unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    run.wait().await.unwrap();

    let err = run.answer_gate("y").unwrap_err();
    assert!(err.to_string().contains("No gate pending"));
}

#[tokio::test]
async fn gate_timeout_unregisters_gate() {
    let session = Session::new("wf-gate-timeout", "test");
    let workflow = Workflow::create("impatient", &session, |ctx| async move {
        match ctx.gate("hurry", Some(Duration::from_millis(100)), None).await {
            Err(CoreError::Timeout(_)) => Ok(json!("timed-out")),
            other => other.map(Value::String),
        }
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("timed-out"));
    assert!(run.pending_gate().is_none());

    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"gate_timeout".to_string()));
}

#[tokio::test]
async fn cancelled_run_cancels_its_gate() {
    let session = Session::new("wf-cancel", "test");
    let workflow = Workflow::create("waiter", &session, |ctx| async move {
        let answer = ctx.gate("forever", None, None).await?;
        Ok(json!(answer))
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    wait_for_gate(&run).await;

    run.cancel().await;
    assert_eq!(run.state(), WorkflowState::Cancelled);
    assert!(run.pending_gate().is_none());

    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"gate_cancelled".to_string()));
    assert!(events.contains(&"workflow_cancelled".to_string()));

    assert!(matches!(run.wait().await.unwrap_err(), CoreError::Cancelled));
}

#[tokio::test]
async fn cancel_after_completion_is_noop() {
    let session = Session::new("wf-cancel-late", "test");
    let workflow = Workflow::create("quick", &session, |_ctx| async move { Ok(json!(7)) }).unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    run.wait().await.unwrap();
    run.cancel().await;
    assert_eq!(run.state(), WorkflowState::Completed);
}

#[tokio::test]
async fn context_runs_nodes_and_emits_events() {
    let session = Session::new("wf-run-node", "test");
    FunctionNode::create("upper", &session, |ctx| {
        Ok(json!({"success": true, "output": ctx.input_str().to_uppercase()}))
    })
    .unwrap();

    let workflow = Workflow::create("driver", &session, |ctx| async move {
        let result = ctx.run("upper", ctx.input.clone(), None).await?;
        Ok(result["output"].clone())
    })
    .unwrap();

    let run = start_run(&workflow, &session, json!("hello"));
    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("HELLO"));

    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"node_started".to_string()));
    assert!(events.contains(&"node_completed".to_string()));
}

#[tokio::test]
async fn context_missing_node_is_not_found() {
    let session = Session::new("wf-missing-node", "test");
    let workflow = Workflow::create("driver", &session, |ctx| async move {
        ctx.run("ghost", Value::Null, None).await
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    let err = run.wait().await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn context_runs_graphs() {
    let session = Session::new("wf-run-graph", "test");
    let node = FunctionNode::create("echo", &session, |ctx| {
        Ok(json!({"success": true, "output": ctx.input_str()}))
    })
    .unwrap();

    let graph = Graph::create("pipeline", &session).unwrap();
    graph
        .add_step("only", Step::node(node).with_input(json!("through-graph")))
        .unwrap();

    let workflow = Workflow::create("driver", &session, |ctx| async move {
        let result = ctx.run_graph("pipeline", Value::Null, None).await?;
        Ok(result["output"]["output"].clone())
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("through-graph"));
}

#[tokio::test]
async fn nested_workflow_forwards_events() {
    let session = Session::new("wf-nested", "test");
    Workflow::create("inner", &session, |ctx| async move {
        ctx.emit("inner_progress", json!({"step": 1}));
        Ok(json!("inner-done"))
    })
    .unwrap();

    let outer = Workflow::create("outer", &session, |ctx| async move {
        let value = ctx.run_workflow("inner", json!("x"), None, None).await?;
        Ok(value)
    })
    .unwrap();

    let run = start_run(&outer, &session, Value::Null);
    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("inner-done"));

    // Give the fire-and-forget forwarders a beat to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events: Vec<String> = run.events().iter().map(|e| e.event_type.clone()).collect();
    assert!(events.contains(&"nested_workflow_started".to_string()));
    assert!(events.contains(&"nested_workflow_completed".to_string()));
    assert!(events.iter().any(|e| e == "nested:inner_progress"));
    assert!(events.iter().any(|e| e == "nested:workflow_completed"));

    // The child run unregistered itself.
    assert!(session.list_runs().len() <= 1);
}

#[tokio::test]
async fn nested_gate_answered_through_session_registry() {
    let session = Session::new("wf-nested-gate", "test");
    Workflow::create("inner", &session, |ctx| async move {
        let answer = ctx.gate("inner?", None, None).await?;
        Ok(json!(answer))
    })
    .unwrap();
    let outer = Workflow::create("outer", &session, |ctx| async move {
        ctx.run_workflow("inner", Value::Null, None, None).await
    })
    .unwrap();

    let run = start_run(&outer, &session, Value::Null);

    // Find the child run waiting on its gate and answer it.
    let mut answered = false;
    for _ in 0..100 {
        for candidate in session.list_runs() {
            if candidate.pending_gate().is_some() {
                candidate.answer_gate("go").unwrap();
                answered = true;
                break;
            }
        }
        if answered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(answered, "no gate appeared");

    let result = run.wait().await.unwrap();
    assert_eq!(result, json!("go"));
}

#[tokio::test]
async fn parent_cancellation_propagates_to_child() {
    let session = Session::new("wf-cancel-nested", "test");
    Workflow::create("inner", &session, |ctx| async move {
        let answer = ctx.gate("never answered", None, None).await?;
        Ok(json!(answer))
    })
    .unwrap();
    let outer = Workflow::create("outer", &session, |ctx| async move {
        ctx.run_workflow("inner", Value::Null, None, None).await
    })
    .unwrap();

    let run = start_run(&outer, &session, Value::Null);

    // Wait until the child's gate exists, then cancel the parent.
    for _ in 0..100 {
        if session.list_runs().iter().any(|r| r.pending_gate().is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let child = session
        .list_runs()
        .into_iter()
        .find(|r| r.pending_gate().is_some())
        .expect("child waiting");

    run.cancel().await;
    assert_eq!(run.state(), WorkflowState::Cancelled);

    for _ in 0..100 {
        if child.is_complete() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(child.state(), WorkflowState::Cancelled);
}

#[tokio::test]
async fn state_map_persists_across_steps() {
    let session = Session::new("wf-state", "test");
    let workflow = Workflow::create("counter", &session, |ctx| async move {
        for _ in 0..3 {
            let next = ctx.state.lock().get("count").and_then(Value::as_u64).unwrap_or(0) + 1;
            ctx.state.lock().insert("count".into(), json!(next));
        }
        let count = ctx.state.lock()["count"].clone();
        Ok(count)
    })
    .unwrap();

    let run = start_run(&workflow, &session, Value::Null);
    assert_eq!(run.wait().await.unwrap(), json!(3));
}
