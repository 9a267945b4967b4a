//! Bin-packing planner
//!
//! Beads are ordered so every bead comes after the beads that block it,
//! then packed greedily into tasks whose summed complexity stays within the
//! budget. A bead that alone exceeds the budget still gets a task of its own.
//! Planning is all-or-nothing: every bead must have a cached estimate before
//! the first task is created.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::scheduler::{ScheduleError, Scheduler};
use crate::domain::{
    Bead, BeadGraph, ComplexityBudget, GraphError, NewTask, Task, TaskId, TaskType,
    ValidationError, WorkId,
};
use crate::storage::{PlannerConfig, Store, StoreError};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("No complexity estimate for: {}", .0.join(", "))]
    Unestimated(Vec<String>),

    #[error("Estimation failed: {0}")]
    Estimation(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One bin produced by the packer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackedTask {
    pub bead_ids: Vec<String>,
    pub complexity: u32,
}

/// Packs `(bead, score)` pairs, already in dependency order, into bins.
///
/// A bin is closed as soon as the next bead would push it over `budget`.
pub fn pack_beads<S: AsRef<str>>(items: &[(S, u32)], budget: u32) -> Vec<PackedTask> {
    let mut bins = Vec::new();
    let mut current = PackedTask {
        bead_ids: Vec::new(),
        complexity: 0,
    };

    for (id, score) in items {
        if !current.bead_ids.is_empty() && current.complexity + score > budget {
            bins.push(std::mem::replace(
                &mut current,
                PackedTask {
                    bead_ids: Vec::new(),
                    complexity: 0,
                },
            ));
        }
        current.bead_ids.push(id.as_ref().to_string());
        current.complexity += score;
    }

    if !current.bead_ids.is_empty() {
        bins.push(current);
    }
    bins
}

/// Fills the complexity cache for beads that have no estimate yet
pub trait Estimator {
    fn estimate(&self, work_id: &WorkId, beads: &[Bead]) -> Result<(), PlanError>;
}

/// Estimates by running an `estimate` task through the scheduler
pub struct AgentEstimator<'s, 'a> {
    scheduler: &'s Scheduler<'a>,
}

impl<'s, 'a> AgentEstimator<'s, 'a> {
    pub fn new(scheduler: &'s Scheduler<'a>) -> Self {
        Self { scheduler }
    }
}

impl Estimator for AgentEstimator<'_, '_> {
    fn estimate(&self, work_id: &WorkId, beads: &[Bead]) -> Result<(), PlanError> {
        let store = self.scheduler.store();
        let task = store.create_task(
            &NewTask::new(work_id.clone(), TaskType::Estimate)
                .with_beads(beads.iter().map(|b| b.id.clone())),
        )?;
        info!(task = %task.id, beads = beads.len(), "estimating beads");

        self.scheduler
            .run_task(&task.id)
            .map_err(|e| PlanError::Estimation(e.to_string()))?;
        Ok(())
    }
}

/// A created task with the beads packed into it
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    #[serde(flatten)]
    pub task: Task,
    pub bead_ids: Vec<String>,
}

/// Result of a planning run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
    /// Created tasks, in packing order
    pub tasks: Vec<PlannedTask>,

    /// Beads the estimator pre-pass was run for
    pub estimated: Vec<String>,
}

pub struct Planner<'a> {
    store: &'a Store,
    config: PlannerConfig,
}

impl<'a> Planner<'a> {
    pub fn new(store: &'a Store, config: PlannerConfig) -> Self {
        Self { store, config }
    }

    /// Partitions `beads` into implement tasks of `work_id`.
    ///
    /// With `auto_group` off every bead gets its own task. An estimator is
    /// only consulted when grouping; without one, a bead with no cached
    /// estimate fails the plan.
    pub fn plan(
        &self,
        work_id: &WorkId,
        beads: &[Bead],
        estimator: Option<&dyn Estimator>,
    ) -> Result<PlanReport, PlanError> {
        let mut report = PlanReport::default();
        if beads.is_empty() {
            return Ok(report);
        }

        let budget = ComplexityBudget::new(self.config.budget as i64)?.value();
        self.store.get_work(work_id)?;

        let graph = BeadGraph::from_beads(beads)?;
        let order = graph.topological_order()?;
        let by_id: HashMap<&str, &Bead> = beads.iter().map(|b| (b.id.as_str(), b)).collect();
        let ordered: Vec<&Bead> = order
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();

        let packed = if self.config.auto_group {
            let mut scores = self.cached_scores(&ordered)?;
            let missing: Vec<Bead> = ordered
                .iter()
                .filter(|b| !scores.contains_key(b.id.as_str()))
                .map(|b| (*b).clone())
                .collect();

            if !missing.is_empty() {
                let Some(estimator) = estimator else {
                    return Err(PlanError::Unestimated(
                        missing.into_iter().map(|b| b.id).collect(),
                    ));
                };
                estimator.estimate(work_id, &missing)?;
                report.estimated = missing.iter().map(|b| b.id.clone()).collect();

                scores = self.cached_scores(&ordered)?;
                let still_missing: Vec<String> = missing
                    .into_iter()
                    .filter(|b| !scores.contains_key(b.id.as_str()))
                    .map(|b| b.id)
                    .collect();
                if !still_missing.is_empty() {
                    return Err(PlanError::Unestimated(still_missing));
                }
            }

            let items: Vec<(&str, u32)> = ordered
                .iter()
                .map(|b| (b.id.as_str(), scores[b.id.as_str()]))
                .collect();
            pack_beads(&items, budget)
        } else {
            let scores = self.cached_scores(&ordered)?;
            ordered
                .iter()
                .map(|b| PackedTask {
                    bead_ids: vec![b.id.clone()],
                    complexity: scores.get(b.id.as_str()).copied().unwrap_or(0),
                })
                .collect()
        };

        let mut task_of: HashMap<String, TaskId> = HashMap::new();
        for bin in packed {
            let mut depends_on: Vec<TaskId> = Vec::new();
            for bead_id in &bin.bead_ids {
                for blocker in by_id[bead_id.as_str()].blocking_ids() {
                    if let Some(task_id) = task_of.get(blocker) {
                        if !depends_on.contains(task_id) {
                            depends_on.push(task_id.clone());
                        }
                    }
                }
            }

            let task = self.store.create_task(
                &NewTask::new(work_id.clone(), TaskType::Implement)
                    .with_beads(bin.bead_ids.iter().cloned())
                    .with_complexity(budget, bin.complexity)
                    .depending_on(depends_on),
            )?;
            debug!(task = %task.id, complexity = bin.complexity, beads = ?bin.bead_ids, "planned task");

            for bead_id in &bin.bead_ids {
                task_of.insert(bead_id.clone(), task.id.clone());
            }
            report.tasks.push(PlannedTask {
                task,
                bead_ids: bin.bead_ids,
            });
        }

        info!(work = %work_id, tasks = report.tasks.len(), budget, "plan created");
        Ok(report)
    }

    fn cached_scores(&self, beads: &[&Bead]) -> Result<HashMap<String, u32>, PlanError> {
        let mut scores = HashMap::new();
        for bead in beads {
            if let Some(estimate) = self
                .store
                .get_cached_complexity(&bead.id, &bead.description_hash())?
            {
                scores.insert(bead.id.clone(), estimate.score.value());
            }
        }
        Ok(scores)
    }
}
