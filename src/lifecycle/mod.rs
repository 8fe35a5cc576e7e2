//! Issue lifecycle: status transitions and the repair-schedule sub-machine.
//!
//! Every operation follows the same shape: take the per-issue lock, load the
//! issue, plan a commit from its current state, then hand the commit to the
//! store, which applies the issue fields and audit rows in one transaction
//! guarded by the issue version. A version conflict (a concurrent general
//! edit) reloads and replans, up to `max_commit_attempts` times.
//!
//! Planning is pure: the `plan_*` functions take the issue and a timestamp
//! and return the commit to apply, or `None` when the call is a no-op.

pub mod schedule;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use twinfix_common::models::NewStatusChange;
use twinfix_common::{Actor, Issue, IssueStatus};

use crate::clock::{Clock, SystemClock};
use crate::errors::TrackerError;
use crate::store::{CommitResult, FixRecord, IssueCommit, IssueStore, LifecycleChange};

pub use schedule::ScheduleChange;

pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 3;

/// One async mutex per issue id, so lifecycle operations on the same issue
/// run one at a time while different issues proceed in parallel.
#[derive(Default)]
pub struct IssueLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl IssueLocks {
    const PRUNE_THRESHOLD: usize = 1024;

    pub async fn acquire(&self, issue_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if map.len() >= Self::PRUNE_THRESHOLD {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            Arc::clone(map.entry(issue_id).or_default())
        };
        lock.lock_owned().await
    }
}

/// Status part of a plan: the audit row plus, for resolved states, the fix
/// record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPlan {
    pub status_change: NewStatusChange,
    pub fix: Option<FixRecord>,
}

impl StatusPlan {
    pub fn new_status(&self) -> IssueStatus {
        self.status_change.new_status
    }

    /// Fold this plan into a commit, returning the audit row.
    pub(crate) fn apply_to(self, change: &mut LifecycleChange) -> NewStatusChange {
        change.status = Some(self.status_change.new_status);
        change.fix = self.fix;
        self.status_change
    }
}

/// Plan a move to `new_status`. Returns `None` when the issue is already in
/// that state.
///
/// Entering `completed` or `fixed` stamps the fixer, the fix time and the
/// whole minutes elapsed since the issue was reported.
pub fn plan_transition(
    issue: &Issue,
    new_status: IssueStatus,
    actor: &Actor,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Option<StatusPlan> {
    if issue.status == new_status {
        return None;
    }
    let fix = new_status.is_resolved().then(|| {
        let at = now.max(issue.created_at);
        FixRecord {
            by_id: actor.id,
            by_name: actor.name.clone(),
            at,
            time_to_fix: (at - issue.created_at).num_minutes(),
        }
    });
    Some(StatusPlan {
        status_change: NewStatusChange {
            issue_id: issue.id,
            old_status: issue.status,
            new_status,
            changed_by_id: actor.id,
            changed_by_name: actor.name.clone(),
            notes,
            changed_at: now,
        },
        fix,
    })
}

pub struct IssueLifecycle {
    store: Arc<dyn IssueStore>,
    locks: IssueLocks,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl IssueLifecycle {
    pub fn new(store: Arc<dyn IssueStore>) -> Self {
        Self {
            store,
            locks: IssueLocks::default(),
            clock: Arc::new(SystemClock),
            max_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Move an issue to `new_status`, recording who did it and why.
    /// Re-submitting the current status returns the issue untouched.
    pub async fn transition(
        &self,
        issue_id: i64,
        new_status: IssueStatus,
        actor: Actor,
        notes: Option<String>,
    ) -> Result<Issue, TrackerError> {
        self.apply(issue_id, "transition", |issue, now| {
            Ok(plan_transition(issue, new_status, &actor, notes.clone(), now).map(|plan| {
                let mut change = LifecycleChange::at(now);
                let status_change = plan.apply_to(&mut change);
                IssueCommit {
                    issue_id: issue.id,
                    expected_version: issue.version,
                    change,
                    status_change: Some(status_change),
                    schedule_entry: None,
                }
            }))
        })
        .await
    }

    /// Load, plan, commit; retry the whole cycle on a version conflict.
    pub(crate) async fn apply<F>(
        &self,
        issue_id: i64,
        operation: &'static str,
        mut plan: F,
    ) -> Result<Issue, TrackerError>
    where
        F: FnMut(&Issue, DateTime<Utc>) -> Result<Option<IssueCommit>, TrackerError> + Send,
    {
        let _guard = self.locks.acquire(issue_id).await;

        for attempt in 1..=self.max_attempts {
            let issue = self
                .store
                .get_issue(issue_id)
                .await?
                .ok_or(TrackerError::IssueNotFound { id: issue_id })?;

            let now = self.clock.now();
            let Some(commit) = plan(&issue, now)? else {
                debug!(issue_id, operation, "No change");
                return Ok(issue);
            };

            match self.store.commit(commit).await? {
                CommitResult::Applied(committed) => {
                    info!(
                        issue_id,
                        operation,
                        status = %committed.issue.status,
                        schedule = committed.issue.schedule_status.map(|s| s.as_str()).unwrap_or("-"),
                        version = committed.issue.version,
                        "Lifecycle change applied"
                    );
                    return Ok(committed.issue);
                }
                CommitResult::NotFound => return Err(TrackerError::IssueNotFound { id: issue_id }),
                CommitResult::Conflict { current_version } => {
                    warn!(
                        issue_id,
                        operation,
                        attempt,
                        expected = issue.version,
                        current = current_version,
                        "Concurrent modification, retrying"
                    );
                }
            }
        }

        Err(TrackerError::Conflict {
            id: issue_id,
            attempts: self.max_attempts,
        })
    }
}
