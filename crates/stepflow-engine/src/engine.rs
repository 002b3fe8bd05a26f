use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use stepflow_core::config::AppConfig;
use stepflow_core::definition::{
    OnStepFailure, ParallelStep, StepDefinition, StepKind, WorkflowDefinition,
};
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{EventBus, WorkflowEvent};
use stepflow_core::traits::{AgentInvoker, WorkflowStore};
use stepflow_core::types::{
    new_id, CircuitSnapshot, Execution, ExecutionReport, ExecutionStatus, StepRecord, Workflow,
    WorkflowUpdate,
};
use stepflow_invoke::{CircuitBreakerRegistry, GuardedInvoker};

use crate::context::{ExecutionContext, StepOutcome};
use crate::plan::ExecutionPlan;
use crate::resolver::resolve_path;
use crate::steps::{panic_message, resolve_params, StepExecutor, StepRun};

/// Handle on an execution that is currently being driven.
#[derive(Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    execution: Arc<AsyncMutex<Execution>>,
}

/// How the dispatch loop ended.
enum RunOutcome {
    Completed,
    Failed(StepflowError),
    Cancelled,
}

/// How one dispatched step ended.
enum Dispatched {
    Succeeded(Value),
    Failed(StepflowError),
}

/// Creates, runs, and tracks workflow executions.
///
/// Each execution is driven on the caller's task. Steps run one at a time in
/// plan order; a `parallel` block fans its branches out onto their own tasks
/// and joins them before the next step is dispatched. The coordinator is the
/// only writer of the execution context.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    executor: StepExecutor,
    events: Arc<EventBus>,
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, invoker: Arc<GuardedInvoker>) -> Self {
        Self {
            store,
            executor: StepExecutor::new(invoker),
            events: Arc::new(EventBus::default()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Wire an engine from config. Circuit transitions go to the engine's bus.
    pub fn from_config(
        store: Arc<dyn WorkflowStore>,
        agents: Arc<dyn AgentInvoker>,
        config: &AppConfig,
    ) -> Self {
        let events = Arc::new(EventBus::default());
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone())
                .with_events(Arc::clone(&events)),
        );
        let invoker = GuardedInvoker::from_config(agents, config).with_breakers(breakers);
        Self::new(store, Arc::new(invoker)).with_events(events)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    // ── Workflows ───────────────────────────────────────────────

    /// Validate and persist a new workflow.
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        definition: WorkflowDefinition,
        description: Option<String>,
    ) -> Result<Workflow> {
        let plan = ExecutionPlan::build(&definition)?;
        let mut workflow = Workflow::new(definition);
        workflow.name = name.into();
        if description.is_some() {
            workflow.description = description;
        }
        self.store.save_workflow(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = plan.len(),
            "Workflow created"
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| StepflowError::NotFound(format!("workflow {}", workflow_id)))
    }

    pub async fn list_workflows(&self, limit: usize) -> Result<Vec<Workflow>> {
        self.store.list_workflows(limit).await
    }

    /// Apply a partial update. A new definition is validated before it is stored.
    pub async fn update_workflow(&self, workflow_id: &str, update: WorkflowUpdate) -> Result<Workflow> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        if let Some(definition) = update.definition {
            ExecutionPlan::build(&definition)?;
            workflow.definition = definition;
        }
        if let Some(name) = update.name {
            workflow.name = name;
        }
        if let Some(description) = update.description {
            workflow.description = Some(description);
        }
        workflow.updated_at = chrono::Utc::now();
        self.store.save_workflow(&workflow).await?;
        info!(workflow_id, "Workflow updated");
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        if !self.store.delete_workflow(workflow_id).await? {
            return Err(StepflowError::NotFound(format!("workflow {}", workflow_id)));
        }
        info!(workflow_id, "Workflow deleted");
        Ok(())
    }

    // ── Executions ──────────────────────────────────────────────

    /// Run a stored workflow to completion under a fresh correlation id.
    ///
    /// Step failures never surface as `Err`: they end up in the returned
    /// execution's status and outputs. `Err` means the workflow could not be
    /// loaded or planned, or the store failed mid-run.
    pub async fn execute_workflow(&self, workflow_id: &str, inputs: Value) -> Result<Execution> {
        self.execute_workflow_with_correlation(workflow_id, inputs, new_id())
            .await
    }

    pub async fn execute_workflow_with_correlation(
        &self,
        workflow_id: &str,
        inputs: Value,
        correlation_id: impl Into<String>,
    ) -> Result<Execution> {
        let workflow = self.get_workflow(workflow_id).await?;
        let plan = ExecutionPlan::build(&workflow.definition)?;

        let execution = Execution::new(&workflow.id, inputs, correlation_id);
        let run = ActiveRun {
            cancel: CancellationToken::new(),
            execution: Arc::new(AsyncMutex::new(execution.clone())),
        };
        {
            // Registered before the row exists; a cancel waits on this lock.
            let _pending = run.execution.lock().await;
            self.runs_lock().insert(execution.id.clone(), run.clone());
            if let Err(e) = self.store.create_execution(&execution).await {
                self.runs_lock().remove(&execution.id);
                return Err(e);
            }
        }

        let span = info_span!(
            "execution",
            execution_id = %execution.id,
            correlation_id = %execution.correlation_id,
            workflow_id = %workflow.id,
        );
        let result = self.drive(&workflow, &plan, &run).instrument(span).await;
        self.runs_lock().remove(&execution.id);
        result
    }

    /// Cooperatively cancel an execution.
    ///
    /// Steps already dispatched finish; nothing new is dispatched. Terminal
    /// executions are returned unchanged.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<Execution> {
        let active = self.runs_lock().get(execution_id).cloned();
        if let Some(run) = active {
            let mut execution = run.execution.lock().await;
            if !execution.status.is_terminal() {
                let mut cancelled = execution.clone();
                cancelled.transition(ExecutionStatus::Cancelled)?;
                run.cancel.cancel();
                if self.commit(&mut execution, cancelled).await? {
                    self.events.publish(WorkflowEvent::ExecutionCancelled {
                        execution_id: execution_id.to_string(),
                    });
                    info!(execution_id, "Execution cancelled");
                }
            }
            return Ok(execution.clone());
        }

        // Not driven here. The engine driving it sees the stored state
        // before its next dispatch.
        let mut execution = self.load_execution(execution_id).await?;
        if !execution.status.is_terminal() {
            let mut cancelled = execution.clone();
            cancelled.transition(ExecutionStatus::Cancelled)?;
            if self.commit(&mut execution, cancelled).await? {
                self.events.publish(WorkflowEvent::ExecutionCancelled {
                    execution_id: execution_id.to_string(),
                });
                info!(execution_id, "Cancellation recorded in store");
            }
        }
        Ok(execution)
    }

    /// The execution record, live if it is running here.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        let active = self.runs_lock().get(execution_id).cloned();
        match active {
            Some(run) => Ok(run.execution.lock().await.clone()),
            None => self.load_execution(execution_id).await,
        }
    }

    /// Status, progress, and per-step summary of an execution.
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionReport> {
        let execution = self.get_execution(execution_id).await?;
        let records = self.store.list_steps(execution_id).await?;
        let total_steps = match self.store.load_workflow(&execution.workflow_id).await? {
            Some(workflow) => workflow.definition.steps.len(),
            None => records.len(),
        };
        Ok(ExecutionReport::build(&execution, &records, total_steps))
    }

    /// Step records of an execution in dispatch order.
    pub async fn get_execution_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        self.load_execution(execution_id).await?;
        self.store.list_steps(execution_id).await
    }

    /// Most recent executions of a workflow first.
    pub async fn get_execution_history(&self, workflow_id: &str, limit: usize) -> Result<Vec<Execution>> {
        self.store.list_executions(workflow_id, limit).await
    }

    // ── Circuits ────────────────────────────────────────────────

    pub fn circuit_state(&self, agent_id: &str, method_id: &str) -> Option<CircuitSnapshot> {
        self.executor.invoker().circuit_state(agent_id, method_id)
    }

    /// Every circuit this engine has used, sorted by target.
    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.executor.invoker().breakers().snapshots()
    }

    /// Force a circuit back to CLOSED. Returns `false` if it was never used.
    pub fn reset_circuit(&self, agent_id: &str, method_id: &str) -> bool {
        self.executor.invoker().reset_circuit(agent_id, method_id)
    }

    // ── Coordinator ─────────────────────────────────────────────

    async fn load_execution(&self, execution_id: &str) -> Result<Execution> {
        self.store
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| StepflowError::NotFound(format!("execution {}", execution_id)))
    }

    /// Persist `next` and make it current. When the stored execution is
    /// already terminal the stored state becomes current instead and `false`
    /// is returned.
    async fn commit(&self, current: &mut Execution, next: Execution) -> Result<bool> {
        if self.store.update_execution(&next).await? {
            *current = next;
            return Ok(true);
        }
        *current = self.load_execution(&next.id).await?;
        Ok(false)
    }

    /// Whether dispatch should stop: cancelled here, or finished in the store
    /// by another engine.
    async fn cancel_requested(&self, run: &ActiveRun) -> Result<bool> {
        if run.cancel.is_cancelled() {
            return Ok(true);
        }
        let mut execution = run.execution.lock().await;
        let Some(stored) = self.store.load_execution(&execution.id).await? else {
            return Ok(false);
        };
        if !stored.status.is_terminal() {
            return Ok(false);
        }
        info!(status = %stored.status, "Execution finished in store, stopping dispatch");
        if stored.status == ExecutionStatus::Cancelled {
            self.events.publish(WorkflowEvent::ExecutionCancelled {
                execution_id: stored.id.clone(),
            });
        }
        *execution = stored;
        run.cancel.cancel();
        Ok(true)
    }

    fn runs_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drive(&self, workflow: &Workflow, plan: &ExecutionPlan, run: &ActiveRun) -> Result<Execution> {
        let (execution_id, mut ctx) = {
            let mut execution = run.execution.lock().await;
            if !execution.status.is_terminal() {
                let mut running = execution.clone();
                running.transition(ExecutionStatus::Running)?;
                if !self.commit(&mut execution, running).await? {
                    run.cancel.cancel();
                }
            }
            let ctx = ExecutionContext::new(
                &execution.id,
                &execution.correlation_id,
                execution.inputs.clone(),
            );
            self.events.publish(WorkflowEvent::ExecutionStarted {
                execution_id: execution.id.clone(),
                workflow_id: workflow.id.clone(),
                correlation_id: execution.correlation_id.clone(),
            });
            (execution.id.clone(), ctx)
        };
        info!(steps = plan.len(), "Execution started");

        let outcome = match self
            .run_steps(&execution_id, &workflow.definition, plan, &mut ctx, run)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Execution aborted by internal error");
                let outputs = json!({ "error": e.to_string() });
                if let Err(mark) = self.finish(run, ExecutionStatus::Error, Some(outputs)).await {
                    warn!(error = %mark, "Failed to mark aborted execution");
                }
                return Err(e);
            }
        };

        let (status, outputs) = match outcome {
            RunOutcome::Completed => (
                ExecutionStatus::Success,
                Some(collect_outputs(&workflow.definition, &ctx)),
            ),
            RunOutcome::Failed(e) => (ExecutionStatus::Error, Some(json!({ "error": e.to_string() }))),
            RunOutcome::Cancelled => (ExecutionStatus::Cancelled, None),
        };
        self.finish(run, status, outputs).await
    }

    /// Move the execution to its final state unless a cancel got there first.
    async fn finish(
        &self,
        run: &ActiveRun,
        status: ExecutionStatus,
        outputs: Option<Value>,
    ) -> Result<Execution> {
        let mut execution = run.execution.lock().await;
        if execution.status.is_terminal() {
            return Ok(execution.clone());
        }
        let mut finished = execution.clone();
        finished.outputs = outputs;
        finished.transition(status)?;
        if !self.commit(&mut execution, finished).await? {
            info!(status = %execution.status, "Execution already finished in store");
            return Ok(execution.clone());
        }

        let total_duration_ms = execution.total_duration_ms.unwrap_or(0);
        self.events.publish(WorkflowEvent::ExecutionFinished {
            execution_id: execution.id.clone(),
            status,
            total_duration_ms,
        });
        match status {
            ExecutionStatus::Success => info!(total_duration_ms, "Execution succeeded"),
            _ => warn!(status = %status, total_duration_ms, "Execution ended"),
        }
        Ok(execution.clone())
    }

    async fn run_steps(
        &self,
        execution_id: &str,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
        run: &ActiveRun,
    ) -> Result<RunOutcome> {
        let policy = definition.on_step_failure();
        let steps = plan.top_level_steps();
        let cancel = &run.cancel;

        for (position, step) in steps.iter().enumerate() {
            if self.cancel_requested(run).await? {
                info!(next_step = %step.id, "Cancellation observed, stopping dispatch");
                self.skip_steps(execution_id, plan, &steps[position..], "execution cancelled")
                    .await?;
                return Ok(RunOutcome::Cancelled);
            }

            let dispatched = match &step.kind {
                StepKind::Parallel(parallel) => {
                    self.run_parallel(execution_id, step, parallel, plan, ctx, cancel, policy)
                        .await?
                }
                _ => self.run_step(execution_id, step, ctx, cancel).await?,
            };

            match dispatched {
                Dispatched::Succeeded(output) => ctx.record(&step.id, StepOutcome::success(output)),
                Dispatched::Failed(e) => {
                    ctx.record(&step.id, StepOutcome::failure(e.root_cause().to_string()));
                    let rest = &steps[position + 1..];
                    if cancel.is_cancelled() {
                        self.skip_steps(execution_id, plan, rest, "execution cancelled")
                            .await?;
                        return Ok(RunOutcome::Cancelled);
                    }
                    if policy == OnStepFailure::Stop {
                        warn!(step_id = %step.id, "Stopping execution after step failure");
                        let reason = format!("upstream step '{}' failed", step.id);
                        self.skip_steps(execution_id, plan, rest, &reason).await?;
                        return Ok(RunOutcome::Failed(e.in_step(&step.id)));
                    }
                    debug!(step_id = %step.id, "Continuing past failed step");
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        Ok(RunOutcome::Completed)
    }

    async fn run_step(
        &self,
        execution_id: &str,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Dispatched> {
        let mut record = StepRecord::start(execution_id, step);
        self.store.create_step(&record).await?;
        self.publish_started(&record);
        info!(step_id = %step.id, kind = step.kind_name(), "Executing step");

        // A panicking executor fails the step, not the engine.
        let run = AssertUnwindSafe(self.executor.run(step, ctx, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(StepRun::panicked);
        record.inputs = run.inputs;
        self.settle(&mut record, run.result).await
    }

    /// Fan the block's branches out, then join them all.
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        execution_id: &str,
        step: &StepDefinition,
        parallel: &ParallelStep,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        policy: OnStepFailure,
    ) -> Result<Dispatched> {
        let mut block = StepRecord::start(execution_id, step);
        block.inputs = Some(json!({ "steps": parallel.steps }));
        self.store.create_step(&block).await?;
        self.publish_started(&block);
        info!(step_id = %step.id, branches = parallel.steps.len(), "Fanning out parallel block");

        let mut branches = FuturesUnordered::new();
        let mut undispatched = Vec::new();
        for sub_id in &parallel.steps {
            let Some(sub) = plan.step(sub_id) else { continue };
            let StepKind::AgentCall(call) = &sub.kind else { continue };
            if cancel.is_cancelled() {
                undispatched.push(sub);
                continue;
            }

            let params = resolve_params(call, ctx);
            let mut record = StepRecord::start(execution_id, sub).with_parent(&step.id);
            record.inputs = Some(params.clone());
            self.store.create_step(&record).await?;
            self.publish_started(&record);
            debug!(step_id = %sub.id, parent = %step.id, "Dispatching branch");

            let handle = self
                .executor
                .spawn_agent_call(call.clone(), params, cancel.clone());
            branches.push(async move { (record, handle.await) });
        }

        let mut results = Map::new();
        let mut failures = Vec::new();
        while let Some((mut record, joined)) = branches.next().await {
            let result = joined.unwrap_or_else(|e| {
                let reason = if e.is_panic() {
                    format!("branch panicked: {}", panic_message(e.into_panic().as_ref()))
                } else {
                    format!("branch task aborted: {}", e)
                };
                Err(StepflowError::InvalidState(reason))
            });
            let sub_id = record.step_id.clone();
            match self.settle(&mut record, result).await? {
                Dispatched::Succeeded(output) => {
                    results.insert(sub_id.clone(), output.clone());
                    ctx.record(sub_id, StepOutcome::success(output));
                }
                Dispatched::Failed(e) => {
                    results.insert(sub_id.clone(), Value::Null);
                    ctx.record(sub_id.clone(), StepOutcome::failure(e.root_cause().to_string()));
                    failures.push((sub_id, e));
                }
            }
        }

        for sub in undispatched {
            self.skip_one(execution_id, sub, Some(step.id.as_str()), "execution cancelled")
                .await?;
        }

        let output = json!({ "parallelResults": results });
        let result = if policy == OnStepFailure::Stop && !failures.is_empty() {
            failures.sort_by_key(|(id, _)| parallel.steps.iter().position(|s| s == id));
            let (sub_id, e) = failures.swap_remove(0);
            block.outputs = Some(output);
            Err(e.in_step(sub_id))
        } else {
            Ok(output)
        };
        self.settle(&mut block, result).await
    }

    /// Write the final state of a step record and announce it.
    async fn settle(&self, record: &mut StepRecord, result: Result<Value>) -> Result<Dispatched> {
        match result {
            Ok(output) => {
                record.succeed(output.clone());
                self.store.update_step(record).await?;
                let duration_ms = record.duration_ms.unwrap_or(0);
                self.events.publish(WorkflowEvent::StepCompleted {
                    execution_id: record.execution_id.clone(),
                    step_id: record.step_id.clone(),
                    duration_ms,
                });
                info!(step_id = %record.step_id, duration_ms, "Step completed");
                Ok(Dispatched::Succeeded(output))
            }
            Err(e) => {
                record.fail(e.to_string());
                self.store.update_step(record).await?;
                self.events.publish(WorkflowEvent::StepFailed {
                    execution_id: record.execution_id.clone(),
                    step_id: record.step_id.clone(),
                    error: e.to_string(),
                });
                error!(step_id = %record.step_id, error = %e, "Step failed");
                Ok(Dispatched::Failed(e))
            }
        }
    }

    /// Record `skipped` for steps that will never be dispatched, including
    /// the branches of any skipped `parallel` block.
    async fn skip_steps(
        &self,
        execution_id: &str,
        plan: &ExecutionPlan,
        steps: &[&StepDefinition],
        reason: &str,
    ) -> Result<()> {
        for step in steps {
            self.skip_one(execution_id, step, None, reason).await?;
            if let StepKind::Parallel(parallel) = &step.kind {
                for sub in parallel.steps.iter().filter_map(|id| plan.step(id)) {
                    self.skip_one(execution_id, sub, Some(step.id.as_str()), reason).await?;
                }
            }
        }
        Ok(())
    }

    async fn skip_one(
        &self,
        execution_id: &str,
        step: &StepDefinition,
        parent: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let mut record = StepRecord::skipped(execution_id, step, reason);
        if let Some(parent) = parent {
            record = record.with_parent(parent);
        }
        self.store.create_step(&record).await?;
        self.events.publish(WorkflowEvent::StepSkipped {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            reason: reason.to_string(),
        });
        debug!(step_id = %step.id, reason, "Step skipped");
        Ok(())
    }

    fn publish_started(&self, record: &StepRecord) {
        self.events.publish(WorkflowEvent::StepStarted {
            execution_id: record.execution_id.clone(),
            step_id: record.step_id.clone(),
            kind: record.kind.clone(),
        });
    }
}

/// Final outputs: the `include` paths if any, else every step's output.
fn collect_outputs(definition: &WorkflowDefinition, ctx: &ExecutionContext) -> Value {
    match &definition.output {
        Some(spec) if !spec.include.is_empty() => Value::Object(
            spec.include
                .iter()
                .map(|path| (path.clone(), resolve_path(path, ctx)))
                .collect(),
        ),
        _ => ctx.step_outputs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stepflow_core::types::StepStatus;
    use stepflow_invoke::{RetryPolicy, RetryingInvoker};
    use stepflow_store::SqliteStore;
    use stepflow_test_utils::{
        fan_out_workflow, linear_workflow, routing_workflow, single_call_workflow, Reply,
        ScriptedInvoker,
    };

    fn engine(agents: ScriptedInvoker) -> (Arc<WorkflowEngine>, Arc<ScriptedInvoker>) {
        let agents = Arc::new(agents);
        let invoker = GuardedInvoker::new(
            Arc::clone(&agents) as Arc<dyn AgentInvoker>,
            Arc::new(CircuitBreakerRegistry::new(Default::default())),
            RetryingInvoker::new(RetryPolicy::default().with_base_delay(Duration::from_millis(1))),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        (Arc::new(WorkflowEngine::new(store, Arc::new(invoker))), agents)
    }

    fn status_of(records: &[StepRecord], step_id: &str) -> StepStatus {
        records
            .iter()
            .find(|r| r.step_id == step_id)
            .map(|r| r.status)
            .unwrap_or_else(|| panic!("no record for {}", step_id))
    }

    #[tokio::test]
    async fn test_single_call_outputs() {
        let (engine, _) = engine(ScriptedInvoker::new().on("a1", "m1", json!({"x": 1})));
        let wf = engine
            .create_workflow("single", single_call_workflow(), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.outputs, Some(json!({"s1": {"x": 1}})));
        assert!(exec.total_duration_ms.is_some());

        let stored = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_definition() {
        let (engine, _) = engine(ScriptedInvoker::new());
        let cyclic = WorkflowDefinition::new(
            "cyclic",
            vec![
                StepDefinition::agent_call("a", "x", "y").depends_on(&["b"]),
                StepDefinition::agent_call("b", "x", "y").depends_on(&["a"]),
            ],
        );
        let err = engine.create_workflow("cyclic", cyclic, None).await.unwrap_err();
        assert!(matches!(err, StepflowError::DependencyCycle { .. }));
        assert!(engine.list_workflows(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_policy_skips_dependents() {
        let (engine, agents) = engine(ScriptedInvoker::new().failing("a1", "m1", "down"));
        let wf = engine
            .create_workflow("linear", linear_workflow(OnStepFailure::Stop), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Error);
        let error = exec.outputs.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.contains("s1"));
        assert!(error.contains("down"));

        let records = engine.get_execution_steps(&exec.id).await.unwrap();
        assert_eq!(status_of(&records, "s1"), StepStatus::Error);
        assert_eq!(status_of(&records, "s2"), StepStatus::Skipped);
        assert_eq!(agents.calls("a2", "m2"), 0);
        // Default policy: 3 attempts.
        assert_eq!(agents.calls("a1", "m1"), 3);
    }

    #[tokio::test]
    async fn test_continue_policy_exposes_failure_to_later_steps() {
        let (engine, agents) = engine(
            ScriptedInvoker::new()
                .failing("a1", "m1", "down")
                .echo("a2", "m2"),
        );
        let wf = engine
            .create_workflow("linear", linear_workflow(OnStepFailure::Continue), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.outputs, Some(json!({"s1": null, "s2": {"prev": null}})));
        assert_eq!(agents.calls("a2", "m2"), 1);
    }

    #[tokio::test]
    async fn test_parallel_continue_collects_both_branches() {
        let (engine, _) = engine(
            ScriptedInvoker::new()
                .on("a1", "ok", json!({"v": 1}))
                .failing("a2", "flaky", "boom"),
        );
        let wf = engine
            .create_workflow("fan", fan_out_workflow(OnStepFailure::Continue), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        let outputs = exec.outputs.unwrap();
        assert_eq!(
            outputs["fanout"],
            json!({"parallelResults": {"left": {"v": 1}, "right": null}})
        );

        let records = engine.get_execution_steps(&exec.id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(status_of(&records, "left"), StepStatus::Success);
        assert_eq!(status_of(&records, "right"), StepStatus::Error);
        assert_eq!(status_of(&records, "fanout"), StepStatus::Success);
        let right = records.iter().find(|r| r.step_id == "right").unwrap();
        assert_eq!(right.parent_step_id.as_deref(), Some("fanout"));
        assert!(right.error_reason.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_parallel_stop_fails_execution() {
        let (engine, _) = engine(
            ScriptedInvoker::new()
                .on("a1", "ok", json!(1))
                .failing("a2", "flaky", "boom"),
        );
        let wf = engine
            .create_workflow("fan", fan_out_workflow(OnStepFailure::Stop), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Error);
        assert!(exec.outputs.unwrap()["error"].as_str().unwrap().contains("right"));

        let records = engine.get_execution_steps(&exec.id).await.unwrap();
        // Branches still run to completion under stop.
        assert_eq!(status_of(&records, "left"), StepStatus::Success);
        assert_eq!(status_of(&records, "fanout"), StepStatus::Error);
    }

    #[tokio::test]
    async fn test_parallel_branches_run_concurrently() {
        let delay = Duration::from_millis(150);
        let (engine, agents) = engine(
            ScriptedInvoker::new()
                .on("a1", "ok", json!(1))
                .on("a2", "flaky", json!(2))
                .with_delay("a1", "ok", delay)
                .with_delay("a2", "flaky", delay),
        );
        let wf = engine
            .create_workflow("fan", fan_out_workflow(OnStepFailure::Stop), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(agents.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_routing_condition_and_switch() {
        let (engine, agents) = engine(
            ScriptedInvoker::new().on("scorer", "score", json!({"value": 72, "tier": "platinum"})),
        );
        let wf = engine
            .create_workflow("routing", routing_workflow(), Some("route users".into()))
            .await
            .unwrap();
        assert_eq!(wf.description.as_deref(), Some("route users"));

        let exec = engine
            .execute_workflow(&wf.id, json!({"user": "u-1"}))
            .await
            .unwrap();
        let outputs = exec.outputs.unwrap();
        assert_eq!(outputs["is_high"], json!({"conditionResult": true}));
        assert_eq!(outputs["route"], json!({"matchedCase": "gold"}));
        assert_eq!(agents.last_params("scorer", "score"), Some(json!({"user": "u-1"})));
    }

    #[tokio::test]
    async fn test_output_include_paths() {
        let (engine, _) = engine(ScriptedInvoker::new().on("a1", "m1", json!({"x": {"y": 9}})));
        let def = single_call_workflow().with_output(vec![
            "s1.output.x.y".into(),
            "inputs.who".into(),
            "s1.output.missing".into(),
        ]);
        let wf = engine.create_workflow("inc", def, None).await.unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({"who": "me"})).await.unwrap();
        assert_eq!(
            exec.outputs,
            Some(json!({"s1.output.x.y": 9, "inputs.who": "me", "s1.output.missing": null}))
        );
    }

    #[tokio::test]
    async fn test_status_reports_progress() {
        let (engine, _) = engine(ScriptedInvoker::new().failing("a1", "m1", "down"));
        let wf = engine
            .create_workflow("linear", linear_workflow(OnStepFailure::Stop), None)
            .await
            .unwrap();
        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();

        let report = engine.get_execution_status(&exec.id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Error);
        assert_eq!(report.progress, 100.0);
        assert_eq!(report.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let (engine, agents) = engine(
            ScriptedInvoker::new()
                .on("a1", "m1", json!(1))
                .on("a2", "m2", json!(2))
                .with_delay("a1", "m1", Duration::from_millis(200)),
        );
        let wf = engine
            .create_workflow("linear", linear_workflow(OnStepFailure::Stop), None)
            .await
            .unwrap();

        let mut events = engine.subscribe();
        let runner = {
            let engine = Arc::clone(&engine);
            let id = wf.id.clone();
            tokio::spawn(async move { engine.execute_workflow(&id, json!({})).await })
        };

        let execution_id = loop {
            if let WorkflowEvent::StepStarted { execution_id, .. } = events.recv().await.unwrap() {
                break execution_id;
            }
        };
        let cancelled = engine.cancel_execution(&execution_id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        let exec = runner.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);

        let records = engine.get_execution_steps(&exec.id).await.unwrap();
        // In-flight work finishes; nothing new is dispatched.
        assert_eq!(status_of(&records, "s1"), StepStatus::Success);
        assert_eq!(status_of(&records, "s2"), StepStatus::Skipped);
        assert_eq!(agents.calls("a2", "m2"), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let (engine, _) = engine(ScriptedInvoker::new().on("a1", "m1", json!(1)));
        let wf = engine
            .create_workflow("single", single_call_workflow(), None)
            .await
            .unwrap();
        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();

        let after = engine.cancel_execution(&exec.id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Success);
        assert_eq!(after.completed_at, exec.completed_at);

        let err = engine.cancel_execution("missing").await.unwrap_err();
        assert!(matches!(err, StepflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_step_without_calling() {
        let (engine, agents) = engine(ScriptedInvoker::new().script(
            "a1",
            "m1",
            vec![Reply::Fail("down".into())],
        ));
        let wf = engine
            .create_workflow("single", single_call_workflow(), None)
            .await
            .unwrap();

        // Default threshold is 5 failed calls.
        for _ in 0..5 {
            engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        }
        let before = agents.calls("a1", "m1");
        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Error);
        assert!(exec.outputs.unwrap()["error"].as_str().unwrap().contains("OPEN"));
        assert_eq!(agents.calls("a1", "m1"), before);

        assert!(engine.reset_circuit("a1", "m1"));
        assert_eq!(
            engine.circuit_state("a1", "m1").unwrap().state,
            stepflow_core::types::CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_panicking_step_fails_only_that_step() {
        let (engine, agents) = engine(
            ScriptedInvoker::new()
                .script("a1", "m1", vec![Reply::Panic("agent exploded".into())])
                .echo("a2", "m2"),
        );
        let wf = engine
            .create_workflow("linear", linear_workflow(OnStepFailure::Continue), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.outputs, Some(json!({"s1": null, "s2": {"prev": null}})));
        assert_eq!(agents.calls("a1", "m1"), 1);

        let records = engine.get_execution_steps(&exec.id).await.unwrap();
        let s1 = records.iter().find(|r| r.step_id == "s1").unwrap();
        assert_eq!(s1.status, StepStatus::Error);
        assert!(s1
            .error_reason
            .as_deref()
            .unwrap()
            .contains("step panicked: agent exploded"));
    }

    #[tokio::test]
    async fn test_panicking_branch_fails_only_that_branch() {
        let (engine, _) = engine(
            ScriptedInvoker::new()
                .on("a1", "ok", json!({"v": 1}))
                .script("a2", "flaky", vec![Reply::Panic("branch exploded".into())]),
        );
        let wf = engine
            .create_workflow("fan", fan_out_workflow(OnStepFailure::Continue), None)
            .await
            .unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(
            exec.outputs.unwrap()["fanout"],
            json!({"parallelResults": {"left": {"v": 1}, "right": null}})
        );

        let records = engine.get_execution_steps(&exec.id).await.unwrap();
        assert_eq!(status_of(&records, "left"), StepStatus::Success);
        let right = records.iter().find(|r| r.step_id == "right").unwrap();
        assert_eq!(right.status, StepStatus::Error);
        assert!(right
            .error_reason
            .as_deref()
            .unwrap()
            .contains("branch panicked: branch exploded"));
    }

    #[tokio::test]
    async fn test_branch_and_step_errors_read_the_same() {
        let (engine, _) = engine(
            ScriptedInvoker::new()
                .on("a1", "ok", json!(1))
                .failing("a2", "flaky", "boom")
                .failing("a3", "m3", "boom")
                .echo("a4", "m4"),
        );
        let def = WorkflowDefinition::new(
            "errors",
            vec![
                StepDefinition::agent_call("left", "a1", "ok"),
                StepDefinition::agent_call("right", "a2", "flaky"),
                StepDefinition::parallel("fanout", vec!["left".into(), "right".into()]),
                StepDefinition::agent_call("solo", "a3", "m3"),
                StepDefinition::agent_call("report", "a4", "m4")
                    .depends_on(&["fanout", "solo"])
                    .with_params(json!({"branch": "${right.error}", "step": "${solo.error}"})),
            ],
        )
        .with_failure_policy(OnStepFailure::Continue);
        let wf = engine.create_workflow("errors", def, None).await.unwrap();

        let exec = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        let report = &exec.outputs.unwrap()["report"];
        assert_eq!(report["branch"], json!("Agent call failed: a2/flaky: boom"));
        assert_eq!(report["step"], json!("Agent call failed: a3/m3: boom"));
    }

    #[tokio::test]
    async fn test_update_and_delete_workflow() {
        let (engine, _) = engine(ScriptedInvoker::new());
        let wf = engine
            .create_workflow("single", single_call_workflow(), None)
            .await
            .unwrap();

        let updated = engine
            .update_workflow(
                &wf.id,
                WorkflowUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(updated.updated_at >= wf.updated_at);

        let bad = WorkflowUpdate {
            definition: Some(WorkflowDefinition::new("empty", vec![])),
            ..Default::default()
        };
        assert!(engine.update_workflow(&wf.id, bad).await.unwrap_err().is_validation());

        engine.delete_workflow(&wf.id).await.unwrap();
        assert!(matches!(
            engine.get_workflow(&wf.id).await.unwrap_err(),
            StepflowError::NotFound(_)
        ));
        assert!(engine.delete_workflow(&wf.id).await.is_err());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (engine, _) = engine(ScriptedInvoker::new().on("a1", "m1", json!(1)));
        let wf = engine
            .create_workflow("single", single_call_workflow(), None)
            .await
            .unwrap();
        let first = engine.execute_workflow(&wf.id, json!({})).await.unwrap();
        let second = engine
            .execute_workflow_with_correlation(&wf.id, json!({}), "corr-2")
            .await
            .unwrap();
        assert_eq!(second.correlation_id, "corr-2");

        let history = engine.get_execution_history(&wf.id, 10).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }
}
