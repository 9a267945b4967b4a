//! Task domain model
//!
//! Tasks are the schedulable units of work within a work. Each task has a
//! type that decides what the agent is asked to do, a status that only moves
//! forward (pending -> processing -> completed | failed), and zero or more
//! bead memberships that can be completed independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::id::{TaskId, WorkId};

/// What a task asks the agent (or the outbox) to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Estimate,
    Implement,
    Review,
    Pr,
    UpdatePrDescription,
    GithubComment,
    GithubResolveThread,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::Estimate,
        TaskType::Implement,
        TaskType::Review,
        TaskType::Pr,
        TaskType::UpdatePrDescription,
        TaskType::GithubComment,
        TaskType::GithubResolveThread,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Estimate => "estimate",
            TaskType::Implement => "implement",
            TaskType::Review => "review",
            TaskType::Pr => "pr",
            TaskType::UpdatePrDescription => "update-pr-description",
            TaskType::GithubComment => "github-comment",
            TaskType::GithubResolveThread => "github-resolve-thread",
        }
    }

    /// Label used in the task ID. Implement tasks carry none.
    pub fn id_label(&self) -> Option<&'static str> {
        match self {
            TaskType::Implement => None,
            TaskType::Estimate => Some("estimate"),
            TaskType::Review => Some("review"),
            TaskType::Pr => Some("pr"),
            TaskType::UpdatePrDescription => Some("update-pr"),
            TaskType::GithubComment => Some("gh-comment"),
            TaskType::GithubResolveThread => Some("gh-resolve"),
        }
    }

    /// True for task types that exist to work a set of beads
    pub fn requires_beads(&self) -> bool {
        matches!(self, TaskType::Estimate | TaskType::Implement)
    }

    /// True for external side effects that go through the outbox
    pub fn is_github_effect(&self) -> bool {
        matches!(self, TaskType::GithubComment | TaskType::GithubResolveThread)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown task type: {}", s))
    }
}

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Returns true if this status represents successful completion
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Completed and failed are terminal; failed only leaves via an explicit requeue
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                // explicit completion / failure reported before a scheduler claimed it
                | (Pending, Completed)
                | (Pending, Failed)
                // requeue and claim release
                | (Failed, Pending)
                | (Processing, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown task status: {}", other)),
        }
    }
}

/// Membership of a bead in a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskBead {
    pub bead_id: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub work_id: WorkId,
    pub task_type: TaskType,
    pub status: TaskStatus,

    /// Budget the planner packed against
    pub complexity_budget: Option<u32>,

    /// Summed complexity of the member beads
    pub actual_complexity: Option<u32>,

    pub error_message: Option<String>,
    pub pr_url: Option<String>,

    /// Epic bead a review task filed its findings under
    pub review_epic: Option<String>,

    /// `host:pid` of the scheduler holding the claim while processing
    pub claimed_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Sequence number within the work; ordering key for planning and scheduling
    pub fn sequence(&self) -> u32 {
        self.id.sequence()
    }
}

/// Everything needed to create a task; the store allocates the ID
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub work_id: WorkId,
    pub task_type: TaskType,
    pub bead_ids: Vec<String>,
    pub complexity_budget: Option<u32>,
    pub actual_complexity: Option<u32>,
    /// Earlier tasks this one must wait for
    pub depends_on: Vec<TaskId>,
}

impl NewTask {
    pub fn new(work_id: WorkId, task_type: TaskType) -> Self {
        Self {
            work_id,
            task_type,
            bead_ids: Vec::new(),
            complexity_budget: None,
            actual_complexity: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_beads(mut self, bead_ids: impl IntoIterator<Item = String>) -> Self {
        self.bead_ids.extend(bead_ids);
        self
    }

    pub fn with_complexity(mut self, budget: u32, actual: u32) -> Self {
        self.complexity_budget = Some(budget);
        self.actual_complexity = Some(actual);
        self
    }

    pub fn depending_on(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(deps);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_strings() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        assert!("deploy".parse::<TaskType>().is_err());
    }

    #[test]
    fn task_type_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskType::UpdatePrDescription).unwrap();
        assert_eq!(json, "\"update-pr-description\"");
    }

    #[test]
    fn happy_path_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn terminal_states_do_not_move_forward() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn only_bead_carrying_types_require_beads() {
        assert!(TaskType::Implement.requires_beads());
        assert!(TaskType::Estimate.requires_beads());
        assert!(!TaskType::Review.requires_beads());
        assert!(!TaskType::Pr.requires_beads());
    }

    #[test]
    fn implement_tasks_have_no_id_label() {
        assert_eq!(TaskType::Implement.id_label(), None);
        assert_eq!(TaskType::Review.id_label(), Some("review"));
    }
}
