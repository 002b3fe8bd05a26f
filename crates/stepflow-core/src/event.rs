use serde::{Deserialize, Serialize};

use crate::types::{CircuitState, ExecutionStatus};

/// Lifecycle notifications emitted by the engine and the resilience layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        correlation_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
        kind: String,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: String,
        step_id: String,
        error: String,
    },
    StepSkipped {
        execution_id: String,
        step_id: String,
        reason: String,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
        total_duration_ms: u64,
    },
    ExecutionCancelled {
        execution_id: String,
    },
    CircuitStateChanged {
        target: String,
        from: CircuitState,
        to: CircuitState,
    },
}

impl WorkflowEvent {
    /// The execution this event belongs to, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. }
            | Self::ExecutionCancelled { execution_id } => Some(execution_id),
            Self::CircuitStateChanged { .. } => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: "e1".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::StepStarted {
            execution_id: "e1".into(),
            step_id: "s1".into(),
            kind: "agent_call".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), Some("e1"));
    }
}
