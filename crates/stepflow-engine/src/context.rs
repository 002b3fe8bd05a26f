use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use stepflow_core::types::StepStatus;

use crate::resolver::{walk, PathLookup};

/// What later steps can see of a finished step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub output: Value,
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            status: StepStatus::Success,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            status: StepStatus::Error,
            error: Some(error.into()),
        }
    }

    /// `{output, status}`, plus `error` for failed steps.
    pub fn to_value(&self) -> Value {
        let mut v = json!({
            "output": self.output,
            "status": self.status.as_str(),
        });
        if let (Some(error), Value::Object(map)) = (&self.error, &mut v) {
            map.insert("error".into(), Value::String(error.clone()));
        }
        v
    }
}

/// In-memory state of one execution, readable by `${...}` references.
///
/// Root keys are `inputs`, `steps`, `execution_id`, and `correlation_id`.
/// A path starting with a step id is read as `steps.<id>...`.
/// Only the coordinator writes to it, one finished step at a time.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    inputs: Value,
    steps: BTreeMap<String, StepOutcome>,
    execution_id: String,
    correlation_id: String,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<String>,
        correlation_id: impl Into<String>,
        inputs: Value,
    ) -> Self {
        Self {
            inputs,
            steps: BTreeMap::new(),
            execution_id: execution_id.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Store a finished step's result, replacing any earlier entry.
    pub fn record(&mut self, step_id: impl Into<String>, outcome: StepOutcome) {
        self.steps.insert(step_id.into(), outcome);
    }

    /// `{step_id: output}` for every recorded step; failed steps map to `null`.
    pub fn step_outputs(&self) -> Value {
        Value::Object(
            self.steps
                .iter()
                .map(|(id, o)| (id.clone(), o.output.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    /// The whole context as JSON.
    pub fn to_value(&self) -> Value {
        let steps: Map<String, Value> = self
            .steps
            .iter()
            .map(|(id, o)| (id.clone(), o.to_value()))
            .collect();
        json!({
            "inputs": self.inputs,
            "steps": steps,
            "execution_id": self.execution_id,
            "correlation_id": self.correlation_id,
        })
    }

    fn lookup_step(&self, step_id: &str, rest: &[&str]) -> Option<Value> {
        let outcome = self.steps.get(step_id)?;
        match rest.split_first() {
            None => Some(outcome.to_value()),
            Some((&"output", tail)) => walk(&outcome.output, tail).cloned(),
            Some(_) => walk(&outcome.to_value(), rest).cloned(),
        }
    }
}

impl PathLookup for ExecutionContext {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        let (first, rest) = path.split_first()?;
        match *first {
            "inputs" => walk(&self.inputs, rest).cloned(),
            "steps" => {
                let (step_id, tail) = rest.split_first()?;
                self.lookup_step(step_id, tail)
            }
            "execution_id" if rest.is_empty() => Some(Value::String(self.execution_id.clone())),
            "correlation_id" if rest.is_empty() => {
                Some(Value::String(self.correlation_id.clone()))
            }
            step_id => self.lookup_step(step_id, rest),
        }
    }
}
