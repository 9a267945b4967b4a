//! Recording complexity estimates

use thiserror::Error;
use tracing::info;

use super::collaborators::{IssueTracker, TrackerError};
use crate::domain::{
    ComplexityEstimate, ComplexityScore, DescriptionHash, TaskId, TokenEstimate, ValidationError,
};
use crate::storage::{CacheWrite, Store, StoreError};

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one `estimate` call
#[derive(Debug, Clone)]
pub struct EstimateReport {
    pub bead_id: String,
    pub description_hash: DescriptionHash,
    pub estimate: ComplexityEstimate,
    pub write: CacheWrite,

    /// Set when a task was given: whether this call completed it
    pub task_completed: Option<bool>,
}

/// Validates and caches an estimate for a bead's current text.
///
/// Out-of-range values are rejected before anything is read or written.
/// With `task`, the bead is also marked complete in that task, and the task
/// completes once all of its beads are.
pub fn record_estimate(
    store: &Store,
    tracker: &dyn IssueTracker,
    bead_id: &str,
    score: i64,
    tokens: i64,
    task: Option<&TaskId>,
) -> Result<EstimateReport, EstimateError> {
    if bead_id.trim().is_empty() {
        return Err(ValidationError::Missing("bead ID").into());
    }
    let estimate = ComplexityEstimate {
        score: ComplexityScore::new(score)?,
        tokens: TokenEstimate::new(tokens)?,
    };

    if let Some(task_id) = task {
        store.get_task(task_id)?;
    }

    let bead = tracker.get_bead(bead_id)?;
    let hash = bead.description_hash();
    let write = store.cache_complexity(&bead.id, &hash, estimate)?;
    info!(bead = %bead.id, score, tokens, ?write, "cached complexity");

    let task_completed = match task {
        Some(task_id) => {
            store.complete_task_bead(task_id, &bead.id)?;
            let completed = store.check_and_complete_task(task_id)?;
            if completed {
                info!(task = %task_id, "all beads estimated, task completed");
            }
            Some(completed)
        }
        None => None,
    };

    Ok(EstimateReport {
        bead_id: bead.id,
        description_hash: hash,
        estimate,
        write,
        task_completed,
    })
}
