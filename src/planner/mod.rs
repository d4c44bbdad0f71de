//! Planning and execution.
//!
//! This module compares desired configuration against recorded state,
//! produces ordered plans, and executes them against a provider.

mod diff;
mod executor;
mod plan;
mod resolver;

pub use diff::DiffEngine;
pub use executor::{DEFAULT_PARALLELISM, ExecutionResult, PlanExecutor, ResourceOutcome};
pub use plan::{
    Action, AttributeChange, Plan, PlanEntry, PlanMode, PlanSummary, ReplaceStrategy,
};
pub use resolver::OutputResolver;
