//! Workflow planning and execution.
//!
//! The engine owns the phase machine: plan → design → (backend) →
//! implementation ⇌ review → deployment, with bounded quality and
//! build-retry loops, a per-workflow refinement inbox, persist-before-
//! side-effect checkpointing, and startup recovery.

mod engine;
mod plan;
pub mod progress;

pub use engine::{WorkflowEngine, WorkflowError};
pub use plan::{Planner, WorkflowPlan};
