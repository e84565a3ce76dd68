use crate::error::InvokeError;
use async_trait::async_trait;
use model::value::{InputMap, OutputMap};
use std::collections::HashMap;
use std::sync::Arc;

pub mod scripted;

/// Performs one remote workflow invocation.
///
/// The caller owns the deadline: invocations are raced against a per-call
/// timeout and a cancellation signal, so implementations only need to honor
/// task cancellation at await points.
#[async_trait]
pub trait WorkflowInvoker: Send + Sync {
    async fn invoke(&self, inputs: &InputMap) -> Result<OutputMap, InvokeError>;
}

/// Resolves a batch's workflow reference to an invoker.
///
/// An unknown reference is a Permanent error; recovery marks batches whose
/// workflow can no longer be resolved as failed rather than leaving them
/// dangling.
#[async_trait]
pub trait InvokerProvider: Send + Sync {
    async fn invoker_for(
        &self,
        workflow_ref: &str,
    ) -> Result<Arc<dyn WorkflowInvoker>, InvokeError>;
}

/// Provider backed by a fixed map of workflow references.
#[derive(Default)]
pub struct StaticInvokerProvider {
    workflows: HashMap<String, Arc<dyn WorkflowInvoker>>,
}

impl StaticInvokerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(
        mut self,
        workflow_ref: &str,
        invoker: Arc<dyn WorkflowInvoker>,
    ) -> Self {
        self.workflows.insert(workflow_ref.to_string(), invoker);
        self
    }
}

#[async_trait]
impl InvokerProvider for StaticInvokerProvider {
    async fn invoker_for(
        &self,
        workflow_ref: &str,
    ) -> Result<Arc<dyn WorkflowInvoker>, InvokeError> {
        self.workflows
            .get(workflow_ref)
            .cloned()
            .ok_or_else(|| InvokeError::permanent(format!("unknown workflow: {workflow_ref}")))
    }
}
