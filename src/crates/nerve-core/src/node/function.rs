//! In-process callable wrapped as a node, for composition in graphs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{ExecutionContext, Node, NodeInfo, NodeState};
use crate::error::Result;
use crate::session::Session;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NodeFn = Arc<dyn Fn(ExecutionContext) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Node wrapping an in-process function.
pub struct FunctionNode {
    id: String,
    fn_: NodeFn,
    state: Mutex<NodeState>,
}

impl std::fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl FunctionNode {
    /// Create and register a node from a synchronous function.
    pub fn create<F>(id: &str, session: &Arc<Session>, f: F) -> Result<Arc<Self>>
    where
        F: Fn(ExecutionContext) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::create_async(id, session, move |ctx| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(ctx) })
        })
    }

    /// Create and register a node from an async function.
    pub fn create_async<F>(id: &str, session: &Arc<Session>, f: F) -> Result<Arc<Self>>
    where
        F: Fn(ExecutionContext) -> BoxFuture<Result<Value>> + Send + Sync + 'static,
    {
        let node = Arc::new(Self {
            id: id.to_string(),
            fn_: Arc::new(f),
            state: Mutex::new(NodeState::Ready),
        });
        session.register_node(node.clone())?;
        Ok(node)
    }
}

#[async_trait]
impl Node for FunctionNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "function"
    }

    fn state(&self) -> NodeState {
        *self.state.lock()
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        (self.fn_)(ctx).await
    }

    async fn stop(&self) {
        *self.state.lock() = NodeState::Stopped;
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: "function".into(),
            state: self.state(),
            persistent: false,
            metadata: json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_function_runs() {
        let session = Session::new("fn-sync", "test");
        let node = FunctionNode::create("up", &session, |ctx| {
            Ok(json!({"success": true, "output": ctx.input_str().to_uppercase()}))
        })
        .unwrap();

        let ctx = ExecutionContext::new(session).with_input(json!("hello"));
        let result = node.execute(ctx).await.unwrap();
        assert_eq!(result["output"], "HELLO");
    }

    #[tokio::test]
    async fn async_function_runs() {
        let session = Session::new("fn-async", "test");
        let node = FunctionNode::create_async("sleepy", &session, |ctx| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(json!({"success": true, "output": ctx.input_str()}))
            })
        })
        .unwrap();

        let ctx = ExecutionContext::new(session).with_input(json!("later"));
        let result = node.execute(ctx).await.unwrap();
        assert_eq!(result["output"], "later");
    }
}
