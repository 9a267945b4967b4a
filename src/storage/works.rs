//! Work records

use rusqlite::{params, OptionalExtension, Row};

use super::store::{col_parse, col_ts, is_unique_violation, now_ts, ts, Store, StoreError};
use crate::domain::{Work, WorkId, WorkStatus};

const WORK_COLUMNS: &str =
    "id, branch_name, worktree_path, base_branch, status, pr_url, created_at, updated_at";

fn work_from_row(row: &Row<'_>) -> rusqlite::Result<Work> {
    let worktree: String = row.get(2)?;
    Ok(Work {
        id: col_parse(row, 0)?,
        branch_name: row.get(1)?,
        worktree_path: worktree.into(),
        base_branch: row.get(3)?,
        status: col_parse(row, 4)?,
        pr_url: row.get(5)?,
        created_at: col_ts(row, 6)?,
        updated_at: col_ts(row, 7)?,
    })
}

impl Store {
    /// Persists a new work. Fails if the ID or branch is already taken.
    pub fn insert_work(&self, work: &Work) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO works (id, branch_name, worktree_path, base_branch, status, pr_url,
                                    next_task_seq, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
                params![
                    work.id.to_string(),
                    work.branch_name,
                    work.worktree_path.to_string_lossy(),
                    work.base_branch,
                    work.status.as_str(),
                    work.pr_url,
                    ts(work.created_at),
                    ts(work.updated_at),
                ],
            );

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate {
                    kind: "work",
                    id: format!("{} ({})", work.id, work.branch_name),
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn find_work(&self, id: &WorkId) -> Result<Option<Work>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM works WHERE id = ?1", WORK_COLUMNS);
            Ok(conn
                .query_row(&sql, [id.to_string()], work_from_row)
                .optional()?)
        })
    }

    pub fn get_work(&self, id: &WorkId) -> Result<Work, StoreError> {
        self.find_work(id)?
            .ok_or_else(|| StoreError::not_found("work", id))
    }

    pub fn find_work_by_branch(&self, branch: &str) -> Result<Option<Work>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM works WHERE branch_name = ?1", WORK_COLUMNS);
            Ok(conn.query_row(&sql, [branch], work_from_row).optional()?)
        })
    }

    /// Lists works, oldest first
    pub fn list_works(&self, status: Option<WorkStatus>) -> Result<Vec<Work>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM works WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, id",
                WORK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let works = stmt
                .query_map([status.map(|s| s.as_str())], work_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(works)
        })
    }

    pub fn set_work_status(&self, id: &WorkId, status: WorkStatus) -> Result<(), StoreError> {
        self.update_work(
            id,
            "UPDATE works SET status = ?2, updated_at = ?3 WHERE id = ?1",
            status.as_str(),
        )
    }

    pub fn set_work_pr_url(&self, id: &WorkId, pr_url: &str) -> Result<(), StoreError> {
        self.update_work(
            id,
            "UPDATE works SET pr_url = ?2, updated_at = ?3 WHERE id = ?1",
            pr_url,
        )
    }

    fn update_work(&self, id: &WorkId, sql: &str, value: &str) -> Result<(), StoreError> {
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(sql, params![id.to_string(), value, now_ts()])?)
        })?;
        if changed == 0 {
            return Err(StoreError::not_found("work", id));
        }
        Ok(())
    }

    /// Deletes a work and, through cascades, its tasks
    pub fn delete_work(&self, id: &WorkId) -> Result<(), StoreError> {
        let changed = self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM works WHERE id = ?1", [id.to_string()])?)
        })?;
        if changed == 0 {
            return Err(StoreError::not_found("work", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn work(seed: &str) -> Work {
        Work::new(
            WorkId::new(seed, Utc::now()),
            format!("beadflow/{}", seed),
            format!("/tmp/wt/{}", seed),
            "main",
        )
    }

    #[test]
    fn insert_and_get() {
        let store = Store::open_in_memory().unwrap();
        let w = work("login");
        store.insert_work(&w).unwrap();

        let loaded = store.get_work(&w.id).unwrap();
        assert_eq!(loaded.branch_name, "beadflow/login");
        assert_eq!(loaded.status, WorkStatus::Active);
        assert!(loaded.pr_url.is_none());
    }

    #[test]
    fn missing_work_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_work(&"w-0000000".parse().unwrap()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn duplicate_branch_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let a = work("same");
        let mut b = work("other");
        b.branch_name = a.branch_name.clone();

        store.insert_work(&a).unwrap();
        assert!(matches!(
            store.insert_work(&b),
            Err(StoreError::Duplicate { kind: "work", .. })
        ));
    }

    #[test]
    fn find_by_branch() {
        let store = Store::open_in_memory().unwrap();
        let w = work("api");
        store.insert_work(&w).unwrap();

        assert_eq!(
            store.find_work_by_branch("beadflow/api").unwrap().map(|w| w.id),
            Some(w.id)
        );
        assert!(store.find_work_by_branch("nope").unwrap().is_none());
    }

    #[test]
    fn status_and_pr_url_updates() {
        let store = Store::open_in_memory().unwrap();
        let w = work("pr");
        store.insert_work(&w).unwrap();

        store
            .set_work_pr_url(&w.id, "https://github.com/o/r/pull/1")
            .unwrap();
        store.set_work_status(&w.id, WorkStatus::Completed).unwrap();

        let loaded = store.get_work(&w.id).unwrap();
        assert_eq!(loaded.pr_url.as_deref(), Some("https://github.com/o/r/pull/1"));
        assert_eq!(loaded.status, WorkStatus::Completed);
        assert_eq!(store.list_works(Some(WorkStatus::Active)).unwrap().len(), 0);
        assert_eq!(store.list_works(None).unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_record() {
        let store = Store::open_in_memory().unwrap();
        let w = work("gone");
        store.insert_work(&w).unwrap();
        store.delete_work(&w.id).unwrap();

        assert!(store.find_work(&w.id).unwrap().is_none());
        assert!(store.delete_work(&w.id).unwrap_err().is_not_found());
    }
}
