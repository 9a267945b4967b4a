//! Domain models for beadflow
//!
//! Contains the core types and rules without any I/O concerns.

mod bead;
mod complexity;
mod graph;
mod id;
pub mod outbox;
mod task;
mod work;
mod workflow;

pub use bead::{Bead, BeadDependency, BeadStatus, BeadWithChildren, DependencyType};
pub use complexity::{
    ComplexityBudget, ComplexityEstimate, ComplexityScore, DescriptionHash, TokenEstimate,
    ValidationError,
};
pub use graph::{BeadGraph, GraphError};
pub use id::{IdError, TaskId, WorkId, WorkflowId};
pub use outbox::{NewOutboxEntry, OutboxEntry, OutboxStatus};
pub use task::{NewTask, Task, TaskBead, TaskStatus, TaskType};
pub use work::{branch_slug, Work, WorkStatus};
pub use workflow::{StepStatus, WorkflowPayload, WorkflowState, WorkflowStep};
