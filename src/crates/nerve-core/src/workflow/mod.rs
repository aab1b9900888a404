//! Workflow runtime: imperative async flows with human gates.
//!
//! A workflow wraps a user-supplied async function of a [`WorkflowContext`].
//! Starting a run spawns the function as a cancelable background task and
//! returns a [`WorkflowRun`] handle immediately; the function composes nodes,
//! graphs and other workflows through the context helpers and may suspend at
//! [`WorkflowContext::gate`] until an external answer arrives.

mod context;
mod events;
mod run;

pub use context::WorkflowContext;
pub use events::WorkflowEvent;
pub use run::{EventCallback, GateInfo, WorkflowRun, WorkflowState};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::session::Session;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The user-supplied body of a workflow.
pub type WorkflowFn = Arc<dyn Fn(WorkflowContext) -> BoxFuture<Result<Value>> + Send + Sync>;

/// A registered workflow: an id plus its body.
pub struct Workflow {
    id: String,
    session_id: String,
    fn_: WorkflowFn,
}

impl Workflow {
    /// Create and register a workflow in `session`.
    pub fn create<F, Fut>(id: &str, session: &Arc<Session>, f: F) -> Result<Arc<Self>>
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let workflow = Arc::new(Self {
            id: id.to_string(),
            session_id: session.id.clone(),
            fn_: Arc::new(move |ctx| Box::pin(f(ctx))),
        });
        session.register_workflow(workflow.clone())?;
        Ok(workflow)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn body(&self) -> WorkflowFn {
        Arc::clone(&self.fn_)
    }
}
