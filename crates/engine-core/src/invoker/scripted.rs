use crate::error::InvokeError;
use crate::invoker::WorkflowInvoker;
use async_trait::async_trait;
use model::value::{InputMap, OutputMap, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// One scripted response, consumed per attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(OutputMap),
    TransientError(String),
    PermanentError(String),
    /// Never resolves; exercises the caller's timeout handling.
    Hang,
}

/// Deterministic invoker for tests and for the CLI simulator.
///
/// A script is selected by the value of `key_column` in the row's inputs.
/// Each invocation consumes the script's next step; the last step repeats
/// once the script is exhausted. Rows without a script echo their key value
/// back as `result`, optionally failing transiently every N-th call.
pub struct ScriptedInvoker {
    key_column: String,
    scripts: Mutex<HashMap<String, Script>>,
    latency: Option<Duration>,
    fail_every: u64,
    calls: AtomicU64,
    call_log: Mutex<Vec<InputMap>>,
}

struct Script {
    steps: Vec<Step>,
    next: usize,
}

impl Script {
    fn advance(&mut self) -> Step {
        let step = self.steps[self.next.min(self.steps.len() - 1)].clone();
        if self.next + 1 < self.steps.len() {
            self.next += 1;
        }
        step
    }
}

impl ScriptedInvoker {
    pub fn new(key_column: &str) -> Self {
        ScriptedInvoker {
            key_column: key_column.to_string(),
            scripts: Mutex::new(HashMap::new()),
            latency: None,
            fail_every: 0,
            calls: AtomicU64::new(0),
            call_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every N-th unscripted call fail with a transient error.
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    /// Register the step sequence for rows whose key column equals `key`.
    pub fn script(self, key: &str, steps: Vec<Step>) -> Self {
        assert!(!steps.is_empty(), "script needs at least one step");
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), Script { steps, next: 0 });
        self
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_calls(&self) -> Vec<InputMap> {
        self.call_log.lock().unwrap().clone()
    }

    fn key_of(&self, inputs: &InputMap) -> String {
        inputs
            .get(&self.key_column)
            .map(|value| value.to_string())
            .unwrap_or_default()
    }

    fn echo(&self, key: &str, call: u64) -> Result<OutputMap, InvokeError> {
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(InvokeError::transient("simulated transient failure"));
        }
        let mut outputs = OutputMap::new();
        outputs.insert(
            "result".to_string(),
            Value::String(format!("processed: {key}")),
        );
        Ok(outputs)
    }
}

#[async_trait]
impl WorkflowInvoker for ScriptedInvoker {
    async fn invoke(&self, inputs: &InputMap) -> Result<OutputMap, InvokeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_log.lock().unwrap().push(inputs.clone());

        if let Some(latency) = self.latency {
            sleep(latency).await;
        }

        let key = self.key_of(inputs);
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&key).map(|script| script.advance())
        };

        match step {
            Some(Step::Succeed(outputs)) => Ok(outputs),
            Some(Step::TransientError(message)) => Err(InvokeError::transient(message)),
            Some(Step::PermanentError(message)) => Err(InvokeError::permanent(message)),
            Some(Step::Hang) => std::future::pending().await,
            None => self.echo(&key, call),
        }
    }
}

/// Convenience for building a one-field output map.
pub fn output(key: &str, value: &str) -> OutputMap {
    let mut map = OutputMap::new();
    map.insert(key.to_string(), Value::String(value.to_string()));
    map
}
