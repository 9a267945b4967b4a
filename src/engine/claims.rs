//! Claim ownership and stale-claim detection
//!
//! A processing task records `host:pid` of the scheduler that claimed it.
//! If that process dies without releasing the claim, the task would stay
//! processing forever; `is_stale` decides when another scheduler may reset it.

use std::fmt;
use std::process::{Command, Stdio};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::domain::Task;

/// Identity of a scheduler process holding task claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOwner {
    pub host: String,
    pub pid: u32,
}

impl ClaimOwner {
    pub fn current() -> Self {
        Self {
            host: hostname(),
            pid: std::process::id(),
        }
    }

    fn is_local(&self) -> bool {
        self.host == hostname()
    }
}

impl fmt::Display for ClaimOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)
    }
}

impl FromStr for ClaimOwner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, pid) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid claim owner: {}", s))?;
        let pid = pid
            .parse()
            .map_err(|_| format!("Invalid claim owner pid: {}", s))?;
        Ok(Self {
            host: host.to_string(),
            pid,
        })
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Check if a process with the given PID is running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

/// True if a processing task's claim may be reset.
///
/// A claim is stale when it has no owner, when its owner is a dead process
/// on this host, or when it is older than `stale_after`. Claims held by
/// `current` itself are never stale.
pub fn is_stale(
    task: &Task,
    current: &ClaimOwner,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> bool {
    let Some(claimed_by) = task.claimed_by.as_deref() else {
        return true;
    };
    let Some(started_at) = task.started_at else {
        return true;
    };

    if let Ok(owner) = claimed_by.parse::<ClaimOwner>() {
        if owner == *current {
            return false;
        }
        if owner.is_local() && !is_process_running(owner.pid) {
            return true;
        }
    }

    now - started_at > stale_after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskStatus, TaskType, WorkId};

    fn processing(claimed_by: Option<String>, started_at: Option<DateTime<Utc>>) -> Task {
        let work: WorkId = "w-abc1234".parse().unwrap();
        Task {
            id: work.task_id(None, 1),
            work_id: work,
            task_type: TaskType::Implement,
            status: TaskStatus::Processing,
            complexity_budget: None,
            actual_complexity: None,
            error_message: None,
            pr_url: None,
            review_epic: None,
            claimed_by,
            created_at: Utc::now(),
            started_at,
            completed_at: None,
        }
    }

    #[test]
    fn owner_round_trips() {
        let owner: ClaimOwner = "build-box:4242".parse().unwrap();
        assert_eq!(owner.host, "build-box");
        assert_eq!(owner.pid, 4242);
        assert_eq!(owner.to_string(), "build-box:4242");
        assert!("no-pid".parse::<ClaimOwner>().is_err());
    }

    #[test]
    fn own_claims_are_never_stale() {
        let me = ClaimOwner::current();
        let long_ago = Utc::now() - chrono::Duration::days(3);
        let task = processing(Some(me.to_string()), Some(long_ago));

        assert!(!is_stale(&task, &me, Utc::now(), chrono::Duration::hours(4)));
    }

    #[test]
    fn ownerless_claims_are_stale() {
        let me = ClaimOwner::current();
        let task = processing(None, Some(Utc::now()));
        assert!(is_stale(&task, &me, Utc::now(), chrono::Duration::hours(4)));
    }

    #[test]
    fn remote_claims_expire_by_age() {
        let me = ClaimOwner::current();
        let remote = format!("{}-elsewhere:1", me.host);
        let now = Utc::now();

        let fresh = processing(Some(remote.clone()), Some(now - chrono::Duration::minutes(5)));
        assert!(!is_stale(&fresh, &me, now, chrono::Duration::hours(4)));

        let old = processing(Some(remote), Some(now - chrono::Duration::hours(5)));
        assert!(is_stale(&old, &me, now, chrono::Duration::hours(4)));
    }
}
