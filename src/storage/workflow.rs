//! Persisted workflow state
//!
//! Step changes are conditional on the step the caller believes is
//! current, so two drivers that somehow run the same workflow cannot both
//! advance it.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{col_json, col_parse, col_ts, now_ts, ts, Store, StoreError};
use crate::domain::{StepStatus, WorkId, WorkflowId, WorkflowPayload, WorkflowState, WorkflowStep};

const WORKFLOW_COLUMNS: &str = "workflow_id, work_id, current_step, step_status, error_message, \
     payload, created_at, updated_at";

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowState> {
    let work_id: Option<String> = row.get(1)?;
    let work_id = work_id
        .map(|w| w.parse::<WorkId>())
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let step: u8 = row.get(2)?;
    let current_step = WorkflowStep::from_index(step).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(2, step as i64)
    })?;

    Ok(WorkflowState {
        workflow_id: col_parse(row, 0)?,
        work_id,
        current_step,
        step_status: col_parse(row, 3)?,
        error_message: row.get(4)?,
        payload: col_json(row, 5)?,
        created_at: col_ts(row, 6)?,
        updated_at: col_ts(row, 7)?,
    })
}

fn load_state(conn: &Connection, id: &WorkflowId) -> Result<Option<WorkflowState>, StoreError> {
    let sql = format!(
        "SELECT {} FROM workflow_state WHERE workflow_id = ?1",
        WORKFLOW_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [id.to_string()], state_from_row)
        .optional()?)
}

fn step_conflict(id: &WorkflowId, expected: WorkflowStep, actual: Option<WorkflowState>) -> StoreError {
    match actual {
        None => StoreError::not_found("workflow", id),
        Some(state) => StoreError::Conflict {
            id: id.to_string(),
            expected: format!("step {} pending", expected),
            actual: format!("step {} {}", state.current_step, state.step_status),
        },
    }
}

impl Store {
    pub fn create_workflow(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&state.payload)?;
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO workflow_state (workflow_id, work_id, current_step, step_status,
                                             error_message, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (workflow_id) DO NOTHING",
                params![
                    state.workflow_id.to_string(),
                    state.work_id.as_ref().map(|w| w.to_string()),
                    state.current_step.index(),
                    state.step_status.as_str(),
                    state.error_message,
                    payload,
                    ts(state.created_at),
                    ts(state.updated_at),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate {
                    kind: "workflow",
                    id: state.workflow_id.to_string(),
                });
            }
            Ok(())
        })
    }

    pub fn find_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowState>, StoreError> {
        self.with_conn(|conn| load_state(conn, id))
    }

    pub fn load_workflow(&self, id: &WorkflowId) -> Result<WorkflowState, StoreError> {
        self.find_workflow(id)?
            .ok_or_else(|| StoreError::not_found("workflow", id))
    }

    /// Saves step-scoped data without moving the step
    pub fn save_workflow_progress(
        &self,
        id: &WorkflowId,
        step: WorkflowStep,
        work_id: Option<&WorkId>,
        payload: &WorkflowPayload,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE workflow_state
                 SET work_id = COALESCE(?3, work_id), payload = ?4, updated_at = ?5
                 WHERE workflow_id = ?1 AND current_step = ?2 AND step_status = 'pending'",
                params![
                    id.to_string(),
                    step.index(),
                    work_id.map(|w| w.to_string()),
                    payload,
                    now_ts(),
                ],
            )?;
            if changed == 0 {
                return Err(step_conflict(id, step, load_state(conn, id)?));
            }
            Ok(())
        })
    }

    /// Completes `step` and moves to the next one.
    ///
    /// After the last step the state stays on it with status completed.
    pub fn advance_workflow(
        &self,
        id: &WorkflowId,
        step: WorkflowStep,
        payload: &WorkflowPayload,
    ) -> Result<WorkflowState, StoreError> {
        let payload = serde_json::to_string(payload)?;
        let (next_step, next_status) = match step.next() {
            Some(next) => (next, StepStatus::Pending),
            None => (step, StepStatus::Completed),
        };

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE workflow_state
                 SET current_step = ?3, step_status = ?4, error_message = NULL,
                     payload = ?5, updated_at = ?6
                 WHERE workflow_id = ?1 AND current_step = ?2 AND step_status = 'pending'",
                params![
                    id.to_string(),
                    step.index(),
                    next_step.index(),
                    next_status.as_str(),
                    payload,
                    now_ts(),
                ],
            )?;
            if changed == 0 {
                return Err(step_conflict(id, step, load_state(conn, id)?));
            }
            load_state(conn, id)?.ok_or_else(|| StoreError::not_found("workflow", id))
        })
    }

    /// Halts the workflow at `step` with an error
    pub fn fail_workflow_step(
        &self,
        id: &WorkflowId,
        step: WorkflowStep,
        message: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE workflow_state
                 SET step_status = 'failed', error_message = ?3, updated_at = ?4
                 WHERE workflow_id = ?1 AND current_step = ?2 AND step_status = 'pending'",
                params![id.to_string(), step.index(), message, now_ts()],
            )?;
            if changed == 0 {
                return Err(step_conflict(id, step, load_state(conn, id)?));
            }
            Ok(())
        })
    }

    /// Puts a failed step back to pending so the driver retries it
    pub fn retry_workflow_step(&self, id: &WorkflowId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE workflow_state
                 SET step_status = 'pending', error_message = NULL, updated_at = ?2
                 WHERE workflow_id = ?1 AND step_status = 'failed'",
                params![id.to_string(), now_ts()],
            )?;
            if changed == 0 && load_state(conn, id)?.is_none() {
                return Err(StoreError::not_found("workflow", id));
            }
            Ok(changed == 1)
        })
    }

    /// All workflows, most recently touched first
    pub fn list_workflows(&self) -> Result<Vec<WorkflowState>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM workflow_state ORDER BY updated_at DESC, workflow_id",
                WORKFLOW_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let states = stmt
                .query_map([], state_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(states)
        })
    }

    pub fn delete_workflow(&self, id: &WorkflowId) -> Result<(), StoreError> {
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM workflow_state WHERE workflow_id = ?1",
                [id.to_string()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::not_found("workflow", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_state() -> WorkflowState {
        let payload = WorkflowPayload {
            requested_beads: vec!["bd-1".to_string()],
            ..WorkflowPayload::default()
        };
        WorkflowState::new(WorkflowId::new("bd-1", Utc::now()), payload)
    }

    #[test]
    fn create_and_load() {
        let store = Store::open_in_memory().unwrap();
        let state = new_state();
        store.create_workflow(&state).unwrap();

        let loaded = store.load_workflow(&state.workflow_id).unwrap();
        assert_eq!(loaded.current_step, WorkflowStep::CreateWork);
        assert_eq!(loaded.step_status, StepStatus::Pending);
        assert_eq!(loaded.payload.requested_beads, vec!["bd-1"]);
        assert!(matches!(
            store.create_workflow(&state),
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[test]
    fn advance_walks_to_completion() {
        let store = Store::open_in_memory().unwrap();
        let state = new_state();
        store.create_workflow(&state).unwrap();

        let mut current = state.clone();
        for step in WorkflowStep::ALL {
            current = store
                .advance_workflow(&state.workflow_id, step, &current.payload)
                .unwrap();
        }

        assert!(current.is_finished());
        assert!(store
            .advance_workflow(&state.workflow_id, WorkflowStep::CreatePr, &current.payload)
            .is_err());
    }

    #[test]
    fn stale_step_cannot_advance() {
        let store = Store::open_in_memory().unwrap();
        let state = new_state();
        store.create_workflow(&state).unwrap();
        store
            .advance_workflow(&state.workflow_id, WorkflowStep::CreateWork, &state.payload)
            .unwrap();

        assert!(matches!(
            store.advance_workflow(&state.workflow_id, WorkflowStep::CreateWork, &state.payload),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn progress_is_saved_without_advancing() {
        let store = Store::open_in_memory().unwrap();
        let state = new_state();
        store.create_workflow(&state).unwrap();

        let work: WorkId = "w-abc1234".parse().unwrap();
        let mut payload = state.payload.clone();
        payload.bead_ids = vec!["bd-1".into(), "bd-2".into()];
        store
            .save_workflow_progress(&state.workflow_id, WorkflowStep::CreateWork, Some(&work), &payload)
            .unwrap();

        let loaded = store.load_workflow(&state.workflow_id).unwrap();
        assert_eq!(loaded.current_step, WorkflowStep::CreateWork);
        assert_eq!(loaded.work_id, Some(work));
        assert_eq!(loaded.payload.bead_ids.len(), 2);
    }

    #[test]
    fn failure_halts_until_retried() {
        let store = Store::open_in_memory().unwrap();
        let state = new_state();
        store.create_workflow(&state).unwrap();

        store
            .fail_workflow_step(&state.workflow_id, WorkflowStep::CreateWork, "git exploded")
            .unwrap();
        let failed = store.load_workflow(&state.workflow_id).unwrap();
        assert!(failed.is_failed());
        assert_eq!(failed.error_message.as_deref(), Some("git exploded"));
        assert!(store
            .advance_workflow(&state.workflow_id, WorkflowStep::CreateWork, &state.payload)
            .is_err());

        assert!(store.retry_workflow_step(&state.workflow_id).unwrap());
        assert!(!store.retry_workflow_step(&state.workflow_id).unwrap());
        let retried = store.load_workflow(&state.workflow_id).unwrap();
        assert_eq!(retried.step_status, StepStatus::Pending);
        assert!(retried.error_message.is_none());
    }

    #[test]
    fn delete_and_list() {
        let store = Store::open_in_memory().unwrap();
        let state = new_state();
        store.create_workflow(&state).unwrap();
        assert_eq!(store.list_workflows().unwrap().len(), 1);

        store.delete_workflow(&state.workflow_id).unwrap();
        assert!(store.list_workflows().unwrap().is_empty());
        assert!(store.load_workflow(&state.workflow_id).unwrap_err().is_not_found());
    }
}
