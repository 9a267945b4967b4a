//! Task graph: tasks, bead memberships and task dependencies
//!
//! Every status change is a conditional update keyed on the prior status.
//! When the update touches no row the current state is read back so the
//! caller learns whether the task was already where it wanted it
//! (`Transition::AlreadyDone`) or somewhere else (`StoreError::Conflict`).

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::store::{col_opt_ts, col_parse, col_ts, now_ts, Store, StoreError, Transition};
use crate::domain::{NewTask, Task, TaskBead, TaskId, TaskStatus, WorkId};

const TASK_COLUMNS: &str = "t.id, t.work_id, t.task_type, t.status, t.complexity_budget, \
     t.actual_complexity, t.error_message, t.pr_url, t.review_epic, t.claimed_by, \
     t.created_at, t.started_at, t.completed_at";

/// A pending task is ready when no dependency is incomplete
const DEPS_SATISFIED: &str = "NOT EXISTS (
        SELECT 1 FROM task_dependencies d
        JOIN tasks dt ON dt.id = d.depends_on_id
        WHERE d.task_id = t.id AND dt.status != 'completed'
    )";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: col_parse(row, 0)?,
        work_id: col_parse(row, 1)?,
        task_type: col_parse(row, 2)?,
        status: col_parse(row, 3)?,
        complexity_budget: row.get(4)?,
        actual_complexity: row.get(5)?,
        error_message: row.get(6)?,
        pr_url: row.get(7)?,
        review_epic: row.get(8)?,
        claimed_by: row.get(9)?,
        created_at: col_ts(row, 10)?,
        started_at: col_opt_ts(row, 11)?,
        completed_at: col_opt_ts(row, 12)?,
    })
}

fn load_task(conn: &Connection, id: &TaskId) -> Result<Option<Task>, StoreError> {
    let sql = format!("SELECT {} FROM tasks t WHERE t.id = ?1", TASK_COLUMNS);
    Ok(conn
        .query_row(&sql, [id.to_string()], task_from_row)
        .optional()?)
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let tasks = stmt
        .query_map(params, task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

fn current_status(conn: &Connection, id: &TaskId) -> Result<Option<TaskStatus>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?1",
            [id.to_string()],
            |row| col_parse::<TaskStatus>(row, 0),
        )
        .optional()?)
}

/// Interprets an update that touched `changed` rows
fn settle(
    conn: &Connection,
    id: &TaskId,
    changed: usize,
    expected: TaskStatus,
    target: TaskStatus,
) -> Result<Transition, StoreError> {
    if changed > 0 {
        return Ok(Transition::Applied);
    }

    match current_status(conn, id)? {
        None => Err(StoreError::not_found("task", id)),
        Some(actual) if actual == target => Ok(Transition::AlreadyDone),
        Some(actual) => Err(StoreError::Conflict {
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
    }
}

fn check_transition(id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTask(format!(
            "{} cannot move from {} to {}",
            id, from, to
        )))
    }
}

impl Store {
    /// Creates a task with its bead memberships and dependency edges.
    ///
    /// The sequence number comes from the work's counter, and the whole
    /// write is one immediate transaction so a task never exists without
    /// its beads.
    pub fn create_task(&self, new: &NewTask) -> Result<Task, StoreError> {
        if new.task_type.requires_beads() && new.bead_ids.is_empty() {
            return Err(StoreError::InvalidTask(format!(
                "{} task requires at least one bead",
                new.task_type
            )));
        }

        let mut bead_ids: Vec<&str> = Vec::with_capacity(new.bead_ids.len());
        for bead in &new.bead_ids {
            if bead.trim().is_empty() {
                return Err(StoreError::InvalidTask("empty bead ID".to_string()));
            }
            if !bead_ids.contains(&bead.as_str()) {
                bead_ids.push(bead);
            }
        }

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();

            let bumped = tx.execute(
                "UPDATE works SET next_task_seq = next_task_seq + 1, updated_at = ?2 WHERE id = ?1",
                params![new.work_id.to_string(), now],
            )?;
            if bumped == 0 {
                return Err(StoreError::not_found("work", &new.work_id));
            }

            let seq: u32 = tx.query_row(
                "SELECT next_task_seq FROM works WHERE id = ?1",
                [new.work_id.to_string()],
                |row| row.get(0),
            )?;
            let id = new.work_id.task_id(new.task_type.id_label(), seq);

            tx.execute(
                "INSERT INTO tasks (id, work_id, seq, task_type, status, complexity_budget,
                                    actual_complexity, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    new.work_id.to_string(),
                    seq,
                    new.task_type.as_str(),
                    new.complexity_budget,
                    new.actual_complexity,
                    now,
                ],
            )?;

            for (position, bead) in bead_ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO task_beads (task_id, bead_id, position) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), bead, position as i64],
                )?;
            }

            for dep in &new.depends_on {
                if dep.work_id() != &new.work_id {
                    return Err(StoreError::InvalidDependency(format!(
                        "{} belongs to another work",
                        dep
                    )));
                }
                if current_status(&tx, dep)?.is_none() {
                    return Err(StoreError::not_found("task", dep));
                }
                tx.execute(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                    params![id.to_string(), dep.to_string()],
                )?;
            }

            let task = load_task(&tx, &id)?.ok_or_else(|| StoreError::not_found("task", &id))?;
            tx.commit()?;
            Ok(task)
        })
    }

    pub fn find_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.with_conn(|conn| load_task(conn, id))
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.find_task(id)?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    /// All tasks of a work in sequence order
    pub fn list_tasks(&self, work_id: &WorkId) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks t WHERE t.work_id = ?1 ORDER BY t.seq",
                TASK_COLUMNS
            );
            query_tasks(conn, &sql, [work_id.to_string()])
        })
    }

    /// Bead memberships of a task in packing order
    pub fn task_beads(&self, task_id: &TaskId) -> Result<Vec<TaskBead>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT bead_id, completed, completed_at FROM task_beads
                 WHERE task_id = ?1 ORDER BY position",
            )?;
            let beads = stmt
                .query_map([task_id.to_string()], |row| {
                    Ok(TaskBead {
                        bead_id: row.get(0)?,
                        completed: row.get(1)?,
                        completed_at: col_opt_ts(row, 2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(beads)
        })
    }

    /// Tasks this task waits for
    pub fn task_dependencies(&self, task_id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.depends_on_id FROM task_dependencies d
                 JOIN tasks t ON t.id = d.depends_on_id
                 WHERE d.task_id = ?1 ORDER BY t.seq",
            )?;
            let deps = stmt
                .query_map([task_id.to_string()], |row| col_parse::<TaskId>(row, 0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(deps)
        })
    }

    /// Adds `task -> depends_on`. Only edges from a later task to an
    /// earlier task of the same work are accepted, which keeps the graph
    /// acyclic without a cycle check.
    pub fn add_task_dependency(
        &self,
        task_id: &TaskId,
        depends_on: &TaskId,
    ) -> Result<(), StoreError> {
        if task_id.work_id() != depends_on.work_id() {
            return Err(StoreError::InvalidDependency(format!(
                "{} and {} belong to different works",
                task_id, depends_on
            )));
        }

        self.with_conn(|conn| {
            let seq_of = |id: &TaskId| -> Result<u32, StoreError> {
                conn.query_row(
                    "SELECT seq FROM tasks WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("task", id))
            };

            let task_seq = seq_of(task_id)?;
            let dep_seq = seq_of(depends_on)?;
            if dep_seq >= task_seq {
                return Err(StoreError::InvalidDependency(format!(
                    "{} must be created after {}",
                    task_id, depends_on
                )));
            }

            conn.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                params![task_id.to_string(), depends_on.to_string()],
            )?;
            Ok(())
        })
    }

    /// Pending tasks of a work whose dependencies have all completed
    pub fn ready_tasks(&self, work_id: &WorkId) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks t
                 WHERE t.work_id = ?1 AND t.status = 'pending' AND {}
                 ORDER BY t.seq",
                TASK_COLUMNS, DEPS_SATISFIED
            );
            query_tasks(conn, &sql, [work_id.to_string()])
        })
    }

    /// Pending tasks held back by incomplete dependencies, with the blockers
    pub fn blocked_tasks(&self, work_id: &WorkId) -> Result<Vec<(Task, Vec<TaskId>)>, StoreError> {
        let pending = self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks t
                 WHERE t.work_id = ?1 AND t.status = 'pending' AND NOT {}
                 ORDER BY t.seq",
                TASK_COLUMNS, DEPS_SATISFIED
            );
            query_tasks(conn, &sql, [work_id.to_string()])
        })?;

        pending
            .into_iter()
            .map(|task| {
                let blockers = self.with_conn(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT dt.id FROM task_dependencies d
                         JOIN tasks dt ON dt.id = d.depends_on_id
                         WHERE d.task_id = ?1 AND dt.status != 'completed'
                         ORDER BY dt.seq",
                    )?;
                    let ids = stmt
                        .query_map([task.id.to_string()], |row| col_parse::<TaskId>(row, 0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(ids)
                })?;
                Ok((task, blockers))
            })
            .collect()
    }

    /// Tasks currently marked processing, across all works when `work_id` is None
    pub fn processing_tasks(&self, work_id: Option<&WorkId>) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks t
                 WHERE t.status = 'processing' AND (?1 IS NULL OR t.work_id = ?1)
                 ORDER BY t.work_id, t.seq",
                TASK_COLUMNS
            );
            query_tasks(conn, &sql, [work_id.map(|w| w.to_string())])
        })
    }

    /// Claims one specific task if it is pending and ready
    pub fn claim_task(&self, id: &TaskId, owner: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE tasks AS t SET status = 'processing', claimed_by = ?2, started_at = ?3,
                        completed_at = NULL, error_message = NULL
                 WHERE t.id = ?1 AND t.status = 'pending' AND {}",
                DEPS_SATISFIED
            );
            let changed = conn.execute(&sql, params![id.to_string(), owner, now_ts()])?;
            if changed == 0 && current_status(conn, id)?.is_none() {
                return Err(StoreError::not_found("task", id));
            }
            Ok(changed == 1)
        })
    }

    /// Claims the lowest-sequence ready task of a work, if any
    pub fn claim_next_ready(&self, work_id: &WorkId, owner: &str) -> Result<Option<Task>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let sql = format!(
                "SELECT t.id FROM tasks t
                 WHERE t.work_id = ?1 AND t.status = 'pending' AND {}
                 ORDER BY t.seq LIMIT 1",
                DEPS_SATISFIED
            );
            let next: Option<TaskId> = tx
                .query_row(&sql, [work_id.to_string()], |row| col_parse(row, 0))
                .optional()?;

            let Some(id) = next else {
                return Ok(None);
            };

            let changed = tx.execute(
                "UPDATE tasks SET status = 'processing', claimed_by = ?2, started_at = ?3,
                        completed_at = NULL, error_message = NULL
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), owner, now_ts()],
            )?;
            if changed == 0 {
                return Ok(None);
            }

            let task = load_task(&tx, &id)?;
            tx.commit()?;
            Ok(task)
        })
    }

    /// Moves a task from `expected` to completed
    pub fn complete_task(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        pr_url: Option<&str>,
    ) -> Result<Transition, StoreError> {
        check_transition(id, expected, TaskStatus::Completed)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?3, claimed_by = NULL,
                        error_message = NULL, pr_url = COALESCE(?4, pr_url)
                 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), expected.as_str(), now_ts(), pr_url],
            )?;
            settle(conn, id, changed, expected, TaskStatus::Completed)
        })
    }

    /// Moves a task from `expected` to failed, recording the error
    pub fn fail_task(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        message: &str,
    ) -> Result<Transition, StoreError> {
        check_transition(id, expected, TaskStatus::Failed)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?3, claimed_by = NULL,
                        error_message = ?4
                 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), expected.as_str(), now_ts(), message],
            )?;
            settle(conn, id, changed, expected, TaskStatus::Failed)
        })
    }

    /// Puts a failed task back to pending
    pub fn requeue_task(&self, id: &TaskId) -> Result<Transition, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', error_message = NULL, claimed_by = NULL,
                        started_at = NULL, completed_at = NULL
                 WHERE id = ?1 AND status = 'failed'",
                [id.to_string()],
            )?;
            settle(conn, id, changed, TaskStatus::Failed, TaskStatus::Pending)
        })
    }

    /// Hands a claimed task back to pending, only if `owner` still holds it
    pub fn release_task(&self, id: &TaskId, owner: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', claimed_by = NULL, started_at = NULL
                 WHERE id = ?1 AND status = 'processing' AND claimed_by = ?2",
                params![id.to_string(), owner],
            )?;
            Ok(changed == 1)
        })
    }

    /// Resets an abandoned claim, only if the claim is still the one observed
    pub fn reclaim_task(&self, id: &TaskId, seen_owner: Option<&str>) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', claimed_by = NULL, started_at = NULL
                 WHERE id = ?1 AND status = 'processing' AND claimed_by IS ?2",
                params![id.to_string(), seen_owner],
            )?;
            Ok(changed == 1)
        })
    }

    /// Records the epic bead a review task filed its findings under
    pub fn set_review_epic(&self, id: &TaskId, epic: &str) -> Result<(), StoreError> {
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE tasks SET review_epic = ?2 WHERE id = ?1",
                params![id.to_string(), epic],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    /// Marks one bead of a task complete. Repeating the call changes nothing.
    ///
    /// Returns true only when this call did the marking.
    pub fn complete_task_bead(&self, task_id: &TaskId, bead_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE task_beads SET completed = 1, completed_at = ?3
                 WHERE task_id = ?1 AND bead_id = ?2 AND completed = 0",
                params![task_id.to_string(), bead_id, now_ts()],
            )?;
            if changed == 1 {
                return Ok(true);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM task_beads WHERE task_id = ?1 AND bead_id = ?2",
                    params![task_id.to_string(), bead_id],
                    |row| row.get(0),
                )
                .optional()?;
            match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::not_found(
                    "task bead",
                    format!("{} in {}", bead_id, task_id),
                )),
            }
        })
    }

    /// Completes a pending or processing task once every member bead is complete.
    ///
    /// Returns true if this call completed the task.
    pub fn check_and_complete_task(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?2, claimed_by = NULL
                 WHERE id = ?1
                   AND status IN ('pending', 'processing')
                   AND EXISTS (SELECT 1 FROM task_beads b WHERE b.task_id = tasks.id)
                   AND NOT EXISTS (
                       SELECT 1 FROM task_beads b WHERE b.task_id = tasks.id AND b.completed = 0
                   )",
                params![task_id.to_string(), now_ts()],
            )?;
            if changed == 0 && current_status(conn, task_id)?.is_none() {
                return Err(StoreError::not_found("task", task_id));
            }
            Ok(changed == 1)
        })
    }

    /// Pending or processing tasks, in any work, that contain the bead
    pub fn open_tasks_with_bead(&self, bead_id: &str) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks t
                 JOIN task_beads b ON b.task_id = t.id
                 WHERE b.bead_id = ?1 AND t.status IN ('pending', 'processing')
                 ORDER BY t.work_id, t.seq",
                TASK_COLUMNS
            );
            query_tasks(conn, &sql, [bead_id])
        })
    }

    /// Works that hold the bead in any task, whatever the task's status
    pub fn works_holding_bead(&self, bead_id: &str) -> Result<Vec<WorkId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT t.work_id FROM tasks t
                 JOIN task_beads b ON b.task_id = t.id
                 WHERE b.bead_id = ?1
                 ORDER BY t.work_id",
            )?;
            let works = stmt
                .query_map([bead_id], |row| col_parse::<WorkId>(row, 0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(works)
        })
    }

    /// Works, other than `except`, that hold the bead in any task
    pub fn other_works_holding_bead(
        &self,
        bead_id: &str,
        except: &WorkId,
    ) -> Result<Vec<WorkId>, StoreError> {
        let mut works = self.works_holding_bead(bead_id)?;
        works.retain(|w| w != except);
        Ok(works)
    }

    /// Task counts by status, across all works when `work_id` is None
    pub fn task_status_counts(
        &self,
        work_id: Option<&WorkId>,
    ) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM tasks
                 WHERE (?1 IS NULL OR work_id = ?1)
                 GROUP BY status",
            )?;
            let mut counts = stmt
                .query_map([work_id.map(|w| w.to_string())], |row| {
                    Ok((col_parse::<TaskStatus>(row, 0)?, row.get::<_, u64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            counts.sort_by_key(|(status, _)| *status as u8);
            Ok(counts)
        })
    }
}
