//! Build and execute a small dependency graph in-process.
//!
//! Run with: `cargo run --example simple_graph -p nerve-core`

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use nerve_core::node::{BashNode, ExecutionContext};
use nerve_core::{Graph, Session, Step};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new("demo", "example");

    let pick = BashNode::create("pick", &session, None, HashMap::new(), None)?;
    let shout = BashNode::create("shout", &session, None, HashMap::new(), None)?;

    let graph = Graph::create("pipeline", &session)?;
    graph.add_step("number", Step::node(pick).with_input(json!("echo 7")))?;
    graph.add_step(
        "loud",
        Step::node(shout)
            .after(["number"])
            .with_input_fn(Arc::new(|upstream| {
                let n = upstream["number"]["output"].as_str().unwrap_or("").trim();
                Ok(json!(format!("echo 'the number is {n}!'")))
            })),
    )?;

    let ctx = ExecutionContext::new(session);
    let result = graph.execute(ctx).await?;

    println!("success: {}", result["success"]);
    println!("output:  {}", result["output"]["output"]);
    Ok(())
}
