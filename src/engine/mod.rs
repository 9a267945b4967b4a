//! # Engine
//!
//! Everything that drives tasks forward: the planner that packs beads into
//! implement tasks, the scheduler that claims and runs them, the outbox that
//! performs GitHub effects at most once, the review-fix loop and the
//! resumable workflow driver.
//!
//! External systems are reached only through the traits in
//! [`collaborators`], so the engine runs against in-process fakes in tests
//! and against the `bd`, `git`, `gh` and agent CLIs in production.

mod cancel;
mod claims;
pub mod collaborators;
mod collect;
mod completion;
mod estimate;
mod outbox;
mod planner;
mod review;
mod scheduler;
mod warnings;
mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancelToken;
pub use claims::{is_stale, ClaimOwner};
pub use collaborators::{
    AgentError, AgentExecutor, EffectError, GithubEffects, IssueTracker, PromptContext,
    TrackerError, WorktreeError, WorktreeManager,
};
pub use collect::collect_beads;
pub use completion::{
    Completer, CompletionError, CompletionReport, CompletionRequest, CompletionTarget,
};
pub use estimate::{record_estimate, EstimateError, EstimateReport};
pub use outbox::{DispatchOutcome, Effect, OutboxDispatcher, OutboxError, SweepReport};
pub use planner::{
    pack_beads, AgentEstimator, Estimator, PackedTask, PlanError, PlanReport, PlannedTask,
    Planner,
};
pub use review::{
    DetectionContext, EpicIssueDetector, IssueDetector, ReadySnapshotDetector, ReviewError,
    ReviewFixLoop, ReviewOutcome,
};
pub use scheduler::{RunReport, ScheduleError, Scheduler};
pub use warnings::{Warning, Warnings};
pub use workflow::{WorkflowDriver, WorkflowError, WorkflowLock};
