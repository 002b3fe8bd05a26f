use std::collections::HashMap;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use stepflow_core::config::{AgentEndpointConfig, AppConfig};
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::AgentInvoker;

/// JSON-RPC "Invalid params" error code.
const INVALID_PARAMS: i64 = -32602;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Value,
}

/// Agent Invocation Service client speaking JSON-RPC 2.0 over HTTP.
///
/// Each agent id maps to one endpoint URL; the method id becomes the
/// JSON-RPC `method`.
pub struct JsonRpcInvoker {
    http: Client,
    endpoints: HashMap<String, AgentEndpointConfig>,
}

impl JsonRpcInvoker {
    pub fn new(endpoints: HashMap<String, AgentEndpointConfig>) -> Self {
        Self {
            http: Client::new(),
            endpoints,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.agents.clone())
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.endpoints.contains_key(agent_id)
    }
}

impl AgentInvoker for JsonRpcInvoker {
    fn invoke(
        &self,
        agent_id: &str,
        method_id: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        let agent_id = agent_id.to_string();
        let method_id = method_id.to_string();

        Box::pin(async move {
            let endpoint = self
                .endpoints
                .get(&agent_id)
                .ok_or_else(|| StepflowError::NotFound(format!("agent '{}'", agent_id)))?;

            let request = RpcRequest {
                jsonrpc: "2.0",
                id: uuid::Uuid::new_v4().to_string(),
                method: &method_id,
                params,
            };
            debug!(agent_id = %agent_id, method_id = %method_id, url = %endpoint.url, "Calling agent");

            let mut builder = self
                .http
                .post(&endpoint.url)
                .header("content-type", "application/json");
            for (name, value) in &endpoint.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder.json(&request).send().await.map_err(|e| {
                StepflowError::AgentInvocation {
                    agent_id: agent_id.clone(),
                    method_id: method_id.clone(),
                    message: e.to_string(),
                }
            })?;

            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| StepflowError::AgentInvocation {
                agent_id: agent_id.clone(),
                method_id: method_id.clone(),
                message: format!("failed to read response body: {}", e),
            })?;

            interpret_response(&agent_id, &method_id, status, &body)
        })
    }
}

/// Map an HTTP status and JSON-RPC body to a result or a classified error.
pub(crate) fn interpret_response(
    agent_id: &str,
    method_id: &str,
    status: u16,
    body: &str,
) -> Result<Value> {
    let invalid = |message: String| StepflowError::InvalidParams {
        agent_id: agent_id.to_string(),
        method_id: method_id.to_string(),
        message,
    };
    let failed = |message: String| StepflowError::AgentInvocation {
        agent_id: agent_id.to_string(),
        method_id: method_id.to_string(),
        message,
    };

    if status == 400 || status == 422 {
        return Err(invalid(format!("HTTP {}: {}", status, body)));
    }
    if !(200..300).contains(&status) {
        return Err(failed(format!("HTTP {}: {}", status, body)));
    }

    let payload: Value =
        serde_json::from_str(body).map_err(|e| failed(format!("malformed response: {}", e)))?;

    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(match code {
            Some(INVALID_PARAMS) => invalid(message),
            Some(code) => failed(format!("{} (code {})", message, code)),
            None => failed(message),
        });
    }

    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
}
