//! Mocks and fixtures shared by Stepflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepflow_core::definition::{
    ConditionExpr, ConditionOperator, OnStepFailure, StepDefinition, SwitchCase,
    WorkflowDefinition,
};
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::AgentInvoker;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    /// Fails with a retryable `AgentInvocation` error.
    Fail(String),
    /// Fails with a non-retryable `InvalidParams` error.
    InvalidParams(String),
    /// Returns the params the call was made with.
    Echo,
    /// Panics with this message.
    Panic(String),
}

type Key = (String, String);

/// Mock Agent Invocation Service with per-`(agent, method)` scripted replies.
///
/// Replies are consumed in order; the last one repeats once the script runs
/// out. Unscripted targets fail with `AgentInvocation`.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<Key, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, String, Value)>>,
    delays: HashMap<Key, Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always succeed with `result`.
    pub fn on(self, agent_id: &str, method_id: &str, result: Value) -> Self {
        self.script(agent_id, method_id, vec![Reply::Ok(result)])
    }

    /// Always fail with a retryable error.
    pub fn failing(self, agent_id: &str, method_id: &str, message: &str) -> Self {
        self.script(agent_id, method_id, vec![Reply::Fail(message.to_string())])
    }

    /// Reply with the call's params.
    pub fn echo(self, agent_id: &str, method_id: &str) -> Self {
        self.script(agent_id, method_id, vec![Reply::Echo])
    }

    pub fn script(self, agent_id: &str, method_id: &str, replies: Vec<Reply>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(key(agent_id, method_id), replies.into());
        }
        self
    }

    /// Hold every call to this target for `delay` before replying.
    pub fn with_delay(mut self, agent_id: &str, method_id: &str, delay: Duration) -> Self {
        self.delays.insert(key(agent_id, method_id), delay);
        self
    }

    pub fn calls(&self, agent_id: &str, method_id: &str) -> usize {
        self.calls
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|(a, m, _)| a == agent_id && m == method_id)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Params of the most recent call to this target.
    pub fn last_params(&self, agent_id: &str, method_id: &str) -> Option<Value> {
        self.calls.lock().ok().and_then(|c| {
            c.iter()
                .rev()
                .find(|(a, m, _)| a == agent_id && m == method_id)
                .map(|(_, _, p)| p.clone())
        })
    }

    /// Highest number of calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, k: &Key) -> Option<Reply> {
        let mut scripts = self.scripts.lock().ok()?;
        let queue = scripts.get_mut(k)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(
        &self,
        agent_id: &str,
        method_id: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        let k = key(agent_id, method_id);
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((k.0.clone(), k.1.clone(), params.clone()));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&k) {
                tokio::time::sleep(*delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (agent_id, method_id) = k.clone();
            match self.next_reply(&k) {
                Some(Reply::Ok(v)) => Ok(v),
                Some(Reply::Echo) => Ok(params),
                Some(Reply::Panic(message)) => panic!("{}", message),
                Some(Reply::Fail(message)) => Err(StepflowError::AgentInvocation {
                    agent_id,
                    method_id,
                    message,
                }),
                Some(Reply::InvalidParams(message)) => Err(StepflowError::InvalidParams {
                    agent_id,
                    method_id,
                    message,
                }),
                None => Err(StepflowError::AgentInvocation {
                    agent_id,
                    method_id,
                    message: "no scripted reply".into(),
                }),
            }
        })
    }
}

fn key(agent_id: &str, method_id: &str) -> Key {
    (agent_id.to_string(), method_id.to_string())
}

// ---------------------------------------------------------------------------
// Definition fixtures
// ---------------------------------------------------------------------------

/// One `agent_call` step `s1` on `a1/m1` with empty params.
pub fn single_call_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("single", vec![StepDefinition::agent_call("s1", "a1", "m1")])
}

/// `s1 -> s2`, both agent calls; `s2` forwards `s1`'s output.
pub fn linear_workflow(policy: OnStepFailure) -> WorkflowDefinition {
    WorkflowDefinition::new(
        "linear",
        vec![
            StepDefinition::agent_call("s1", "a1", "m1"),
            StepDefinition::agent_call("s2", "a2", "m2")
                .depends_on(&["s1"])
                .with_params(json!({"prev": "${steps.s1.output}"})),
        ],
    )
    .with_failure_policy(policy)
}

/// A `parallel` block `fanout` over two independent calls `left` and `right`.
pub fn fan_out_workflow(policy: OnStepFailure) -> WorkflowDefinition {
    WorkflowDefinition::new(
        "fan-out",
        vec![
            StepDefinition::agent_call("left", "a1", "ok"),
            StepDefinition::agent_call("right", "a2", "flaky"),
            StepDefinition::parallel("fanout", vec!["left".into(), "right".into()]),
        ],
    )
    .with_failure_policy(policy)
}

/// Fetch a score, branch on it with a condition and a switch.
pub fn routing_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "routing",
        vec![
            StepDefinition::agent_call("score", "scorer", "score")
                .with_params(json!({"user": "${inputs.user}"})),
            StepDefinition::condition(
                "is_high",
                ConditionExpr::new(
                    ConditionOperator::GreaterThan,
                    json!("${score.output.value}"),
                    json!(50),
                ),
            )
            .depends_on(&["score"]),
            StepDefinition::switch(
                "route",
                vec![
                    SwitchCase::new(
                        "gold",
                        ConditionExpr::new(
                            ConditionOperator::In,
                            json!("${score.output.tier}"),
                            json!(["gold", "platinum"]),
                        ),
                    ),
                    SwitchCase::new(
                        "standard",
                        ConditionExpr::equals(json!("${score.output.tier}"), json!("standard")),
                    ),
                ],
            )
            .depends_on(&["score"]),
        ],
    )
}
