pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use definition::*;
pub use error::{Result, StepflowError};
pub use event::{EventBus, WorkflowEvent};
pub use traits::{AgentInvoker, WorkflowStore};
pub use types::*;
