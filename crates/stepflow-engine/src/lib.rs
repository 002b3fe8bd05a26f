//! Workflow engine: DAG planning, `${...}` resolution, step execution, and
//! the coordinator that drives executions.
//!
//! A definition is planned once into an [`ExecutionPlan`] (a stable topological
//! order). The [`WorkflowEngine`] walks that order, running each step through
//! the [`StepExecutor`] against an [`ExecutionContext`], persisting a step
//! record for every step and applying the workflow's failure policy.

pub mod condition;
pub mod context;
pub mod engine;
pub mod plan;
pub mod resolver;
pub mod steps;

pub use condition::{compare, evaluate, first_matching_case, ResolvedCondition};
pub use context::{ExecutionContext, StepOutcome};
pub use engine::WorkflowEngine;
pub use plan::ExecutionPlan;
pub use resolver::{resolve, resolve_path, PathLookup};
pub use steps::{StepExecutor, StepRun};
