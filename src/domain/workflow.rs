//! Workflow state
//!
//! A workflow walks seven numbered steps in order. The current step, its
//! status and the step-scoped payload are persisted after every step so a
//! restarted driver resumes at the first step that has not completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::id::{TaskId, WorkId, WorkflowId};

/// The pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    CreateWork,
    CollectBeads,
    PlanTasks,
    ExecuteTasks,
    WaitCompletion,
    ReviewFix,
    CreatePr,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 7] = [
        WorkflowStep::CreateWork,
        WorkflowStep::CollectBeads,
        WorkflowStep::PlanTasks,
        WorkflowStep::ExecuteTasks,
        WorkflowStep::WaitCompletion,
        WorkflowStep::ReviewFix,
        WorkflowStep::CreatePr,
    ];

    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// The step after this one, or None for the last step
    pub fn next(&self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowStep::CreateWork => "create-work",
            WorkflowStep::CollectBeads => "collect-beads",
            WorkflowStep::PlanTasks => "plan-tasks",
            WorkflowStep::ExecuteTasks => "execute-tasks",
            WorkflowStep::WaitCompletion => "wait-completion",
            WorkflowStep::ReviewFix => "review-fix",
            WorkflowStep::CreatePr => "create-pr",
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.index(), self.name())
    }
}

/// Status of the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("Unknown step status: {}", other)),
        }
    }
}

/// Step-scoped data carried between steps and across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowPayload {
    /// Bead IDs the workflow was started for
    pub requested_beads: Vec<String>,

    /// Base branch override; falls back to the configured default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Beads resolved by CollectBeads
    pub bead_ids: Vec<String>,

    /// Tasks created by PlanTasks
    pub task_ids: Vec<TaskId>,

    /// Review-fix iterations fully completed so far
    pub review_iteration: u32,

    /// Review task of the iteration in flight
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_task_id: Option<TaskId>,

    /// Ready beads observed before the in-flight review ran
    pub pre_review_ready: Vec<String>,

    /// Fix tasks created by the review-fix loop
    pub fix_task_ids: Vec<TaskId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_task_id: Option<TaskId>,
}

/// Persisted state of one automated workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub work_id: Option<WorkId>,
    pub current_step: WorkflowStep,
    pub step_status: StepStatus,
    pub error_message: Option<String>,
    pub payload: WorkflowPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_id: WorkflowId, payload: WorkflowPayload) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            work_id: None,
            current_step: WorkflowStep::CreateWork,
            step_status: StepStatus::Pending,
            error_message: None,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the last step has completed
    pub fn is_finished(&self) -> bool {
        self.current_step == WorkflowStep::CreatePr && self.step_status == StepStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.step_status == StepStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered_zero_to_six() {
        assert_eq!(WorkflowStep::CreateWork.index(), 0);
        assert_eq!(WorkflowStep::CreatePr.index(), 6);
        assert_eq!(WorkflowStep::from_index(3), Some(WorkflowStep::ExecuteTasks));
        assert_eq!(WorkflowStep::from_index(7), None);
    }

    #[test]
    fn next_walks_in_order() {
        let mut step = WorkflowStep::CreateWork;
        let mut seen = vec![step];
        while let Some(next) = step.next() {
            seen.push(next);
            step = next;
        }
        assert_eq!(seen, WorkflowStep::ALL.to_vec());
    }

    #[test]
    fn payload_tolerates_missing_fields() {
        let payload: WorkflowPayload =
            serde_json::from_str(r#"{"requested_beads": ["bd-1"]}"#).unwrap();
        assert_eq!(payload.requested_beads, vec!["bd-1"]);
        assert_eq!(payload.review_iteration, 0);
        assert!(payload.task_ids.is_empty());
    }

    #[test]
    fn finished_only_after_last_step_completes() {
        let mut state = WorkflowState::new("wf-1234567".parse().unwrap(), WorkflowPayload::default());
        assert!(!state.is_finished());

        state.current_step = WorkflowStep::CreatePr;
        assert!(!state.is_finished());

        state.step_status = StepStatus::Completed;
        assert!(state.is_finished());
    }
}
