use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Definition errors
    #[error("Invalid workflow definition: {0}")]
    Validation(String),

    #[error("Workflow contains a dependency cycle involving: {}", steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    // Execution errors
    #[error("Step '{step_id}' failed: {source}")]
    StepExecution {
        step_id: String,
        #[source]
        source: Box<StepflowError>,
    },

    #[error("Circuit breaker is OPEN for {target}; recovery attempt in {retry_in_secs}s")]
    CircuitOpen { target: String, retry_in_secs: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    // Agent invocation errors
    #[error("Agent call failed: {agent_id}/{method_id}: {message}")]
    AgentInvocation {
        agent_id: String,
        method_id: String,
        message: String,
    },

    #[error("Invalid parameters for {agent_id}/{method_id}: {message}")]
    InvalidParams {
        agent_id: String,
        method_id: String,
        message: String,
    },

    #[error("Agent call timed out after {timeout_secs}s: {agent_id}/{method_id}")]
    AgentTimeout {
        agent_id: String,
        method_id: String,
        timeout_secs: u64,
    },

    // Lookup / state errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepflowError {
    /// Definition-level errors surfaced at workflow creation time.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::DependencyCycle { .. })
    }

    /// Wrap an error as the failure of a specific step.
    pub fn in_step(self, step_id: impl Into<String>) -> Self {
        match self {
            // Already attributed; keep the innermost step id.
            e @ Self::StepExecution { .. } => e,
            other => Self::StepExecution {
                step_id: step_id.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error without any step attribution.
    pub fn root_cause(&self) -> &StepflowError {
        match self {
            Self::StepExecution { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StepflowError>;
