//! Per-instance execution state shared across concurrent steps.
//!
//! One mutex guards the recorded outputs and the committed-step log, so
//! parallel siblings commit consistently. Commit order of the log is the
//! only order compensation respects.

use std::sync::Mutex;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::workflow::{Compensation, Step};

/// A step that succeeded and declared a compensation. Only such steps
/// enter the log.
#[derive(Debug, Clone)]
pub struct CommittedStep {
    pub step_id: String,
    /// Owning service; compensations run against it.
    pub service: String,
    pub output: JsonValue,
    pub compensation: Compensation,
    pub compensated: bool,
}

/// Result of dispatching one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub output: JsonValue,
    /// True when a `when` guard rendered falsy: nothing gets recorded.
    pub skipped: bool,
}

impl StepOutcome {
    pub fn completed(step_id: impl Into<String>, output: JsonValue) -> Self {
        Self {
            step_id: step_id.into(),
            output,
            skipped: false,
        }
    }

    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            output: JsonValue::Null,
            skipped: true,
        }
    }
}

pub struct ExecutionContext {
    pub workflow_id: String,
    input: JsonValue,
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    variables: JsonMap<String, JsonValue>,
    step_outputs: JsonMap<String, JsonValue>,
    executed_steps: Vec<CommittedStep>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, input: JsonValue) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input,
            inner: Mutex::new(State::default()),
        }
    }

    pub fn input(&self) -> &JsonValue {
        &self.input
    }

    pub fn set_variable(&self, key: impl Into<String>, value: JsonValue) {
        let mut state = self.inner.lock().expect("context lock poisoned");
        state.variables.insert(key.into(), value);
    }

    /// Commit a completed step: record its output under its output name
    /// and append its compensation to the log, atomically. Skipped steps
    /// contribute nothing.
    pub fn commit(&self, step: &Step, outcome: &StepOutcome) {
        if outcome.skipped {
            return;
        }
        let mut state = self.inner.lock().expect("context lock poisoned");
        if let Some(name) = &step.output {
            state.step_outputs.insert(name.clone(), outcome.output.clone());
        }
        if let Some(compensation) = &step.compensate {
            state.executed_steps.push(CommittedStep {
                step_id: step.id.clone(),
                service: step.service.clone(),
                output: outcome.output.clone(),
                compensation: compensation.clone(),
                compensated: false,
            });
        }
    }

    /// The flat object templates render against.
    pub fn scope(&self) -> JsonValue {
        let state = self.inner.lock().expect("context lock poisoned");
        let mut scope = JsonMap::with_capacity(state.step_outputs.len() + 2);
        scope.insert("input".to_string(), self.input.clone());
        scope.insert(
            "variables".to_string(),
            JsonValue::Object(state.variables.clone()),
        );
        for (name, value) in &state.step_outputs {
            scope.insert(name.clone(), value.clone());
        }
        JsonValue::Object(scope)
    }

    pub fn lookup_output(&self, name: &str) -> Option<JsonValue> {
        let state = self.inner.lock().expect("context lock poisoned");
        state.step_outputs.get(name).cloned()
    }

    pub fn output_snapshot(&self) -> JsonMap<String, JsonValue> {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .step_outputs
            .clone()
    }

    /// Snapshot of the committed-step log, in commit order.
    pub fn executed(&self) -> Vec<CommittedStep> {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .executed_steps
            .clone()
    }

    pub fn executed_len(&self) -> usize {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .executed_steps
            .len()
    }

    pub fn mark_compensated(&self, index: usize) {
        let mut state = self.inner.lock().expect("context lock poisoned");
        if let Some(entry) = state.executed_steps.get_mut(index) {
            entry.compensated = true;
        }
    }
}
