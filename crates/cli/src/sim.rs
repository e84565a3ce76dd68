use async_trait::async_trait;
use engine_core::error::InvokeError;
use engine_core::invoker::scripted::ScriptedInvoker;
use engine_core::invoker::{InvokerProvider, WorkflowInvoker};
use std::sync::Arc;
use std::time::Duration;

/// Key column the simulator echoes back; the first CSV column usually
/// carries the query text, so `query` is a reasonable default.
const SIM_KEY_COLUMN: &str = "query";

/// Build the simulated workflow invoker from the CLI flags.
pub fn build_invoker(latency_ms: u64, fail_every: u64) -> Arc<ScriptedInvoker> {
    let mut invoker = ScriptedInvoker::new(SIM_KEY_COLUMN);
    if latency_ms > 0 {
        invoker = invoker.with_latency(Duration::from_millis(latency_ms));
    }
    if fail_every > 0 {
        invoker = invoker.with_fail_every(fail_every);
    }
    Arc::new(invoker)
}

/// Resolves every workflow reference to the same simulated invoker. The
/// real deployment would look references up against the remote service.
pub struct SimulatedProvider {
    invoker: Arc<dyn WorkflowInvoker>,
}

impl SimulatedProvider {
    pub fn new(invoker: Arc<dyn WorkflowInvoker>) -> Self {
        SimulatedProvider { invoker }
    }
}

#[async_trait]
impl InvokerProvider for SimulatedProvider {
    async fn invoker_for(
        &self,
        _workflow_ref: &str,
    ) -> Result<Arc<dyn WorkflowInvoker>, InvokeError> {
        Ok(self.invoker.clone())
    }
}
