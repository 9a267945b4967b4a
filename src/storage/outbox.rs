//! Scheduled outbox rows
//!
//! The idempotency key is the primary key. Scheduling the same key twice
//! returns the existing row, and every status change is conditional, so a
//! completed row is never handed out again.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{col_json, col_opt_ts, col_parse, col_ts, now_ts, ts, Store, StoreError, Transition};
use crate::domain::{NewOutboxEntry, OutboxEntry, OutboxStatus};

const OUTBOX_COLUMNS: &str = "idempotency_key, work_id, task_type, run_at, metadata, attempts, \
     max_attempts, status, last_error, created_at, completed_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        idempotency_key: row.get(0)?,
        work_id: col_parse(row, 1)?,
        task_type: col_parse(row, 2)?,
        run_at: col_ts(row, 3)?,
        metadata: col_json(row, 4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        status: col_parse(row, 7)?,
        last_error: row.get(8)?,
        created_at: col_ts(row, 9)?,
        completed_at: col_opt_ts(row, 10)?,
    })
}

fn load_entry(conn: &Connection, key: &str) -> Result<Option<OutboxEntry>, StoreError> {
    let sql = format!(
        "SELECT {} FROM scheduled_outbox WHERE idempotency_key = ?1",
        OUTBOX_COLUMNS
    );
    Ok(conn.query_row(&sql, [key], entry_from_row).optional()?)
}

impl Store {
    /// Durably records an effect before it is attempted.
    ///
    /// Returns the stored entry and whether this call created it. A second
    /// call with the same key leaves the first entry untouched.
    pub fn schedule_task_with_retry(
        &self,
        new: &NewOutboxEntry,
    ) -> Result<(OutboxEntry, bool), StoreError> {
        if !new.task_type.is_github_effect() {
            return Err(StoreError::InvalidTask(format!(
                "{} is not an outbox effect",
                new.task_type
            )));
        }
        if new.idempotency_key.trim().is_empty() {
            return Err(StoreError::InvalidTask("empty idempotency key".to_string()));
        }

        let metadata = serde_json::to_string(&new.metadata)?;

        self.with_conn(|conn| {
            let created = conn.execute(
                "INSERT INTO scheduled_outbox (idempotency_key, work_id, task_type, run_at,
                                               metadata, attempts, max_attempts, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 'pending', ?7)
                 ON CONFLICT (idempotency_key) DO NOTHING",
                params![
                    new.idempotency_key,
                    new.work_id.to_string(),
                    new.task_type.as_str(),
                    ts(new.run_at),
                    metadata,
                    new.max_attempts.max(1),
                    now_ts(),
                ],
            )? == 1;

            let entry = load_entry(conn, &new.idempotency_key)?
                .ok_or_else(|| StoreError::not_found("outbox entry", &new.idempotency_key))?;
            Ok((entry, created))
        })
    }

    pub fn outbox_entry(&self, key: &str) -> Result<Option<OutboxEntry>, StoreError> {
        self.with_conn(|conn| load_entry(conn, key))
    }

    /// Marks an entry completed after its effect has been confirmed
    pub fn mark_task_completed_by_idempotency_key(&self, key: &str) -> Result<Transition, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_outbox SET status = 'completed', completed_at = ?2, last_error = NULL
                 WHERE idempotency_key = ?1 AND status != 'completed'",
                params![key, now_ts()],
            )?;
            if changed == 1 {
                return Ok(Transition::Applied);
            }
            match load_entry(conn, key)? {
                Some(_) => Ok(Transition::AlreadyDone),
                None => Err(StoreError::not_found("outbox entry", key)),
            }
        })
    }

    /// Claims one attempt of a pending entry.
    ///
    /// Succeeds only if nobody else has bumped `attempts` since the caller
    /// read `seen_attempts`. The entry's `run_at` moves to `next_run_at` so
    /// a concurrent sweep skips it while the attempt is in flight.
    pub fn claim_outbox_attempt(
        &self,
        key: &str,
        seen_attempts: u32,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_outbox SET attempts = attempts + 1, run_at = ?3
                 WHERE idempotency_key = ?1 AND status = 'pending'
                   AND attempts = ?2 AND attempts < max_attempts",
                params![key, seen_attempts, ts(next_run_at)],
            )?;
            Ok(changed == 1)
        })
    }

    /// Records the error from a failed attempt; the entry stays pending
    pub fn record_outbox_failure(&self, key: &str, error: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_outbox SET last_error = ?2
                 WHERE idempotency_key = ?1 AND status = 'pending'",
                params![key, error],
            )?;
            Ok(())
        })
    }

    /// Gives up on a pending entry whose attempts are exhausted
    pub fn mark_outbox_dead(&self, key: &str, error: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_outbox SET status = 'dead', last_error = ?2
                 WHERE idempotency_key = ?1 AND status = 'pending' AND attempts >= max_attempts",
                params![key, error],
            )?;
            Ok(changed == 1)
        })
    }

    /// Pending entries whose `run_at` has passed, oldest first
    pub fn due_outbox_entries(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM scheduled_outbox
                 WHERE status = 'pending' AND run_at <= ?1
                 ORDER BY run_at, idempotency_key",
                OUTBOX_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map([ts(now)], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    pub fn list_outbox(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxEntry>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM scheduled_outbox
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at, idempotency_key",
                OUTBOX_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map([status.map(|s| s.as_str())], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}
