//! Executors for the non-parallel step kinds.
//!
//! `parallel` blocks are fanned out by the coordinator, which owns the step
//! records and the context writes; branches come back through
//! [`StepExecutor::spawn_agent_call`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stepflow_core::definition::{AgentCallStep, StepDefinition, StepKind};
use stepflow_core::error::{Result, StepflowError};
use stepflow_invoke::GuardedInvoker;

use crate::condition::{first_matching_case, ResolvedCondition};
use crate::context::ExecutionContext;
use crate::resolver::resolve;

/// Outcome of one step run, with the inputs it ran on.
#[derive(Debug)]
pub struct StepRun {
    /// Resolved inputs, recorded on the step record.
    pub inputs: Option<Value>,
    pub result: Result<Value>,
}

impl StepRun {
    /// A step whose executor panicked.
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Self {
            inputs: None,
            result: Err(StepflowError::InvalidState(format!(
                "step panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs single steps against the current context.
#[derive(Clone)]
pub struct StepExecutor {
    invoker: Arc<GuardedInvoker>,
}

impl StepExecutor {
    pub fn new(invoker: Arc<GuardedInvoker>) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &Arc<GuardedInvoker> {
        &self.invoker
    }

    pub async fn run(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> StepRun {
        match &step.kind {
            StepKind::AgentCall(call) => {
                let params = resolve_params(call, ctx);
                let result = self.agent_call(call, params.clone(), cancel).await;
                StepRun {
                    inputs: Some(params),
                    result,
                }
            }
            StepKind::Condition(condition) => {
                let resolved = ResolvedCondition::resolve(&condition.condition, ctx);
                StepRun {
                    inputs: Some(resolved.to_value()),
                    result: Ok(json!({ "conditionResult": resolved.holds() })),
                }
            }
            StepKind::Switch(switch) => {
                let matched = first_matching_case(switch, ctx);
                StepRun {
                    inputs: None,
                    result: Ok(json!({ "matchedCase": matched })),
                }
            }
            StepKind::Parallel(_) => StepRun {
                inputs: None,
                result: Err(StepflowError::InvalidState(format!(
                    "parallel step '{}' must be run by the coordinator",
                    step.id
                ))),
            },
        }
    }

    /// Invoke the agent through the circuit breaker and retry policy.
    pub async fn agent_call(
        &self,
        call: &AgentCallStep,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.invoker
            .call(
                &call.agent_id,
                &call.method_id,
                params,
                call.timeout_secs.map(Duration::from_secs),
                cancel,
            )
            .await
    }

    /// Run an agent call as its own task, for parallel fan-out.
    pub fn spawn_agent_call(
        &self,
        call: AgentCallStep,
        params: Value,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<Value>> {
        let executor = self.clone();
        tokio::spawn(async move { executor.agent_call(&call, params, &cancel).await })
    }
}

/// `params` with every `${...}` reference resolved.
pub fn resolve_params(call: &AgentCallStep, ctx: &ExecutionContext) -> Value {
    resolve(&Value::Object(call.params.clone()), ctx)
}
