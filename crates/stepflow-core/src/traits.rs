use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::{Execution, StepRecord, Workflow};

/// Agent invocation service. Executes a named method on a named agent.
pub trait AgentInvoker: Send + Sync + 'static {
    /// Invoke `method_id` on `agent_id` with JSON params, returning the JSON result.
    ///
    /// Implementations report parameter-validation failures as
    /// `StepflowError::InvalidParams` so callers can skip retries.
    fn invoke(
        &self,
        agent_id: &str,
        method_id: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>>;
}

/// Persistence service for workflows, executions, and step records.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert or replace a workflow.
    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;

    fn load_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>>;

    /// Most recently created first.
    fn list_workflows(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Workflow>>>;

    /// Returns `false` when nothing was deleted.
    fn delete_workflow(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    fn create_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    /// Write an execution's state. Returns `false`, leaving the row as it
    /// is, when the stored execution is already terminal.
    fn update_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<bool>>;

    fn load_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Most recently created first.
    fn list_executions(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>>;

    fn create_step(&self, record: &StepRecord) -> BoxFuture<'_, Result<()>>;

    fn update_step(&self, record: &StepRecord) -> BoxFuture<'_, Result<()>>;

    /// Records of one execution in creation order.
    fn list_steps(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<StepRecord>>>;
}
