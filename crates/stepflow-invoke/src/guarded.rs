use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use stepflow_core::config::AppConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::AgentInvoker;
use stepflow_core::types::CircuitSnapshot;

use crate::breaker::CircuitBreakerRegistry;
use crate::retry::{RetryPolicy, RetryingInvoker};

/// An agent invoker protected by a circuit breaker and retries.
///
/// Each call checks the target's circuit, runs the inner invoker under the
/// retry policy with a per-attempt timeout, then records the final outcome
/// on the breaker. Retries inside one call count as a single outcome.
pub struct GuardedInvoker {
    inner: Arc<dyn AgentInvoker>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryingInvoker,
    default_timeout: Duration,
    agent_timeouts: HashMap<String, Duration>,
}

impl GuardedInvoker {
    pub fn new(
        inner: Arc<dyn AgentInvoker>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryingInvoker,
    ) -> Self {
        Self {
            inner,
            breakers,
            retry,
            default_timeout: Duration::from_secs(30),
            agent_timeouts: HashMap::new(),
        }
    }

    /// Build from config: retry policy, breaker defaults, and per-agent timeouts.
    pub fn from_config(inner: Arc<dyn AgentInvoker>, config: &AppConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let mut invoker = Self::new(
            inner,
            breakers,
            RetryingInvoker::new(RetryPolicy::from(&config.retry)),
        )
        .with_default_timeout(config.engine.call_timeout());
        for (agent_id, endpoint) in &config.agents {
            if let Some(secs) = endpoint.timeout_secs {
                invoker = invoker.with_agent_timeout(agent_id, Duration::from_secs(secs));
            }
        }
        invoker
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_agent_timeout(mut self, agent_id: &str, timeout: Duration) -> Self {
        self.agent_timeouts.insert(agent_id.to_string(), timeout);
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn circuit_state(&self, agent_id: &str, method_id: &str) -> Option<CircuitSnapshot> {
        self.breakers.snapshot(&self.breakers.key_for(agent_id, method_id))
    }

    pub fn reset_circuit(&self, agent_id: &str, method_id: &str) -> bool {
        self.breakers.reset(&self.breakers.key_for(agent_id, method_id))
    }

    /// Per-attempt timeout: explicit override, then agent config, then default.
    fn timeout_for(&self, agent_id: &str, timeout_override: Option<Duration>) -> Duration {
        timeout_override
            .or_else(|| self.agent_timeouts.get(agent_id).copied())
            .unwrap_or(self.default_timeout)
    }

    /// Call `method_id` on `agent_id` through the breaker and retry policy.
    pub async fn call(
        &self,
        agent_id: &str,
        method_id: &str,
        params: Value,
        timeout_override: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let key = self.breakers.key_for(agent_id, method_id);
        self.breakers.check_circuit(&key)?;

        let timeout = self.timeout_for(agent_id, timeout_override);
        let inner = &self.inner;
        let params = &params;
        let result = self
            .retry
            .invoke(&key, cancel, |attempt| async move {
                debug!(agent_id, method_id, attempt, "Invoking agent");
                match tokio::time::timeout(timeout, inner.invoke(agent_id, method_id, params.clone()))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StepflowError::AgentTimeout {
                        agent_id: agent_id.to_string(),
                        method_id: method_id.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }),
                }
            })
            .await;

        match &result {
            Ok(_) => self.breakers.record_success(&key),
            Err(e) if counts_against_target(e) => self.breakers.record_failure(&key),
            Err(e) => debug!(agent_id, method_id, error = %e, "Failure not charged to circuit"),
        }
        result
    }
}

/// Transport, timeout, and remote failures say something about the target's
/// health. Bad params, unknown agents, and cancellation do not.
fn counts_against_target(e: &StepflowError) -> bool {
    matches!(
        e,
        StepflowError::AgentInvocation { .. } | StepflowError::AgentTimeout { .. }
    )
}

impl AgentInvoker for GuardedInvoker {
    fn invoke(
        &self,
        agent_id: &str,
        method_id: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        let agent_id = agent_id.to_string();
        let method_id = method_id.to_string();
        Box::pin(async move {
            self.call(&agent_id, &method_id, params, None, &CancellationToken::new())
                .await
        })
    }
}
