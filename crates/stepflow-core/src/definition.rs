//! Declarative workflow definitions.
//!
//! A definition is authored as JSON:
//!
//! ```json
//! {
//!   "name": "enrich-and-route",
//!   "steps": [
//!     { "id": "fetch", "kind": "agent_call", "agent_id": "crm", "method_id": "lookup",
//!       "params": { "email": "${inputs.email}" } },
//!     { "id": "is_vip", "kind": "condition", "depends_on": ["fetch"],
//!       "condition": { "operator": "equals", "left": "${fetch.output.tier}", "right": "vip" } }
//!   ],
//!   "error_handling": { "on_step_failure": "continue" },
//!   "output": { "include": ["steps.is_vip.output"] }
//! }
//! ```
//!
//! Step bodies are a tagged union over `kind`, so each variant carries only
//! the fields it needs. Structural checks (unique ids, known dependencies,
//! acyclicity) live in the engine's plan builder.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StepflowError};

/// Top-level workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<StepDefinition>,

    /// Which context paths make up the execution outputs.
    #[serde(
        default,
        alias = "output_spec",
        alias = "outputSpec",
        skip_serializing_if = "Option::is_none"
    )]
    pub output: Option<OutputSpec>,

    #[serde(default, alias = "errorHandling")]
    pub error_handling: ErrorHandling,
}

impl WorkflowDefinition {
    /// Parse a definition from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StepflowError::Validation(format!("malformed definition: {}", e)))
    }

    /// Parse a definition from an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| StepflowError::Validation(format!("malformed definition: {}", e)))
    }

    /// Load a definition from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            output: None,
            error_handling: ErrorHandling::default(),
        }
    }

    /// Set the step failure policy.
    pub fn with_failure_policy(mut self, policy: OnStepFailure) -> Self {
        self.error_handling.on_step_failure = policy;
        self
    }

    /// Restrict the execution outputs to the given paths.
    pub fn with_output(mut self, include: Vec<String>) -> Self {
        self.output = Some(OutputSpec { include });
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn on_step_failure(&self) -> OnStepFailure {
        self.error_handling.on_step_failure
    }
}

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow; used for `${...}` references.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, alias = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            depends_on: vec![],
            kind,
        }
    }

    /// Create an `agent_call` step with empty params.
    pub fn agent_call(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        method_id: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            StepKind::AgentCall(AgentCallStep {
                agent_id: agent_id.into(),
                method_id: method_id.into(),
                params: Map::new(),
                timeout_secs: None,
            }),
        )
    }

    /// Create a `condition` step.
    pub fn condition(id: impl Into<String>, condition: ConditionExpr) -> Self {
        Self::new(id, StepKind::Condition(ConditionStep { condition }))
    }

    /// Create a `parallel` step over the given sub-step ids.
    pub fn parallel(id: impl Into<String>, steps: Vec<String>) -> Self {
        Self::new(id, StepKind::Parallel(ParallelStep { steps }))
    }

    /// Create a `switch` step.
    pub fn switch(id: impl Into<String>, cases: Vec<SwitchCase>) -> Self {
        Self::new(id, StepKind::Switch(SwitchStep { cases }))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Set agent call params. No-op for other kinds.
    pub fn with_params(mut self, params: Value) -> Self {
        if let (StepKind::AgentCall(call), Value::Object(map)) = (&mut self.kind, params) {
            call.params = map;
        }
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Kind-specific step body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    AgentCall(AgentCallStep),
    Condition(ConditionStep),
    Parallel(ParallelStep),
    Switch(SwitchStep),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentCall(_) => "agent_call",
            Self::Condition(_) => "condition",
            Self::Parallel(_) => "parallel",
            Self::Switch(_) => "switch",
        }
    }
}

/// Invoke a method on a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCallStep {
    #[serde(alias = "agentId")]
    pub agent_id: String,

    #[serde(alias = "methodId")]
    pub method_id: String,

    /// May contain `${path}` references, resolved right before the call.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Per-attempt timeout override.
    #[serde(default, alias = "timeoutSecs", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionStep {
    #[serde(alias = "if_condition", alias = "ifCondition")]
    pub condition: ConditionExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelStep {
    /// Ids of the `agent_call` steps run concurrently by this block.
    #[serde(alias = "parallel_steps", alias = "parallelSteps")]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStep {
    /// Evaluated in order; the first match wins.
    pub cases: Vec<SwitchCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(alias = "caseId")]
    pub case_id: String,
    pub condition: ConditionExpr,
}

impl SwitchCase {
    pub fn new(case_id: impl Into<String>, condition: ConditionExpr) -> Self {
        Self {
            case_id: case_id.into(),
            condition,
        }
    }
}

/// `left <operator> right`, where either operand may be a literal or a `${path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionExpr {
    pub operator: ConditionOperator,
    #[serde(default)]
    pub left: Value,
    #[serde(default)]
    pub right: Value,
}

impl ConditionExpr {
    pub fn new(operator: ConditionOperator, left: Value, right: Value) -> Self {
        Self {
            operator,
            left,
            right,
        }
    }

    pub fn equals(left: Value, right: Value) -> Self {
        Self::new(ConditionOperator::Equals, left, right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    In,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default, alias = "onStepFailure")]
    pub on_step_failure: OnStepFailure,
}

/// What the coordinator does after a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnStepFailure {
    /// Abort remaining steps and mark the execution as failed.
    #[default]
    Stop,
    /// Record the failure in the context and keep going.
    Continue,
}
