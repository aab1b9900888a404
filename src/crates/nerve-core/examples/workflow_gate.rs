//! A workflow that pauses at a human gate and resumes when answered.
//!
//! Run with: `cargo run --example workflow_gate -p nerve-core`

use std::time::Duration;

use serde_json::json;

use nerve_core::workflow::{Workflow, WorkflowRun, WorkflowState};
use nerve_core::Session;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new("demo", "example");

    let workflow = Workflow::create("approve", &session, |ctx| async move {
        ctx.emit("analysis_started", json!({"input": ctx.input}));
        let answer = ctx
            .gate("Ship it?", None, Some(vec!["yes".into(), "no".into()]))
            .await?;
        Ok(json!({"shipped": answer == "yes"}))
    })?;

    let run = WorkflowRun::new(workflow, json!("release-42"), json!({}), None, None);
    session.register_run(&run);
    run.start(session.clone())?;

    // Wait until the run suspends at its gate, then answer from "outside".
    while run.state() != WorkflowState::Waiting {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let gate = run.pending_gate().expect("gate pending");
    println!("gate '{}' asks: {}", gate.gate_id, gate.prompt);

    run.answer_gate("yes")?;
    let result = run.wait().await?;
    println!("workflow result: {result}");
    Ok(())
}
