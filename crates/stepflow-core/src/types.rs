use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::{StepDefinition, StepKind, WorkflowDefinition};
use crate::error::{Result, StepflowError};

/// Generate a fresh opaque identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A stored, validated workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            definition,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied by `update_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub definition: Option<WorkflowDefinition>,
}

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    fn can_become(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Error | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = StepflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StepflowError::InvalidState(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Mutable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub correlation_id: String,
    pub status: ExecutionStatus,
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration_ms: Option<u64>,
}

impl Execution {
    pub fn new(
        workflow_id: impl Into<String>,
        inputs: Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            workflow_id: workflow_id.into(),
            correlation_id: correlation_id.into(),
            status: ExecutionStatus::Pending,
            inputs,
            outputs: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_duration_ms: None,
        }
    }

    /// Move to `next`, stamping timestamps. Terminal states are final.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_become(next) {
            return Err(StepflowError::InvalidState(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            let started = self.started_at.unwrap_or(self.created_at);
            self.total_duration_ms = Some(elapsed_ms(started, now));
        }
        self.status = next;
        Ok(())
    }
}

/// Status of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl StepStatus {
    /// Counted as done for progress purposes.
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = StepflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            other => Err(StepflowError::InvalidState(format!(
                "unknown step status '{}'",
                other
            ))),
        }
    }
}

/// Persisted record of one step run (including each parallel branch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub execution_id: String,
    pub step_id: String,
    pub name: String,
    pub kind: String,
    pub status: StepStatus,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub method_id: Option<String>,
    /// Set for branches run inside a `parallel` block.
    #[serde(default)]
    pub parent_step_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl StepRecord {
    /// A record in `running` state, stamped now.
    pub fn start(execution_id: &str, step: &StepDefinition) -> Self {
        let (agent_id, method_id) = match &step.kind {
            StepKind::AgentCall(call) => (Some(call.agent_id.clone()), Some(call.method_id.clone())),
            _ => (None, None),
        };
        Self {
            id: new_id(),
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            name: step.display_name().to_string(),
            kind: step.kind_name().to_string(),
            status: StepStatus::Running,
            inputs: None,
            outputs: None,
            error_reason: None,
            agent_id,
            method_id,
            parent_step_id: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// A record for a step that was never dispatched.
    pub fn skipped(execution_id: &str, step: &StepDefinition, reason: impl Into<String>) -> Self {
        let mut record = Self::start(execution_id, step);
        record.status = StepStatus::Skipped;
        record.error_reason = Some(reason.into());
        record.started_at = None;
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(0);
        record
    }

    pub fn with_parent(mut self, parent_step_id: impl Into<String>) -> Self {
        self.parent_step_id = Some(parent_step_id.into());
        self
    }

    pub fn succeed(&mut self, output: Value) {
        self.status = StepStatus::Success;
        self.outputs = Some(output);
        self.finish();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Error;
        self.error_reason = Some(reason.into());
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = self.started_at.map(|s| elapsed_ms(s, now));
    }
}

/// Per-step line in an execution status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Answer to `get_execution_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// 0.0 ..= 100.0
    pub progress: f64,
    pub steps: Vec<StepSummary>,
    #[serde(default)]
    pub total_duration_ms: Option<u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionReport {
    /// Build a report. `total_steps` is the number of steps in the definition;
    /// records beyond it (never expected) still count toward the denominator.
    pub fn build(execution: &Execution, records: &[StepRecord], total_steps: usize) -> Self {
        let mut done: Vec<&str> = records
            .iter()
            .filter(|r| r.status.is_complete())
            .map(|r| r.step_id.as_str())
            .collect();
        done.sort_unstable();
        done.dedup();

        Self {
            execution_id: execution.id.clone(),
            status: execution.status,
            progress: progress(done.len(), total_steps.max(records.len())),
            steps: records
                .iter()
                .map(|r| StepSummary {
                    step_id: r.step_id.clone(),
                    status: r.status,
                    duration_ms: r.duration_ms,
                })
                .collect(),
            total_duration_ms: execution.total_duration_ms,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
        }
    }
}

/// `completed / total * 100`, or 0 when there is nothing to do.
pub fn progress(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64) * 100.0
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; requests are rejected.
    Open,
    /// Probing whether the target recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
