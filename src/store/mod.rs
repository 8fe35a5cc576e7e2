//! Storage port for issues and their audit trails.
//!
//! [`IssueStore`] is the seam the rest of the crate talks to. The SQLite
//! backend lives in [`sqlite`]; [`intercept::BroadcastingStore`] wraps any
//! store and turns successful writes into real-time notifications.

pub mod intercept;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use twinfix_common::models::{
    Comment, NewComment, NewIssue, NewRepairScheduleHistory, NewStatusChange, RepairScheduleHistory,
    StatusChange,
};
use twinfix_common::{Issue, IssuePatch, IssueStatistics, IssueStatus, ScheduleStatus};

pub use intercept::BroadcastingStore;
pub use sqlite::{DbHandle, SqliteStore, TrackerDb};

/// Fix record stamped when an issue enters a resolved state.
#[derive(Debug, Clone, PartialEq)]
pub struct FixRecord {
    pub by_id: Option<i64>,
    pub by_name: Option<String>,
    pub at: DateTime<Utc>,
    /// Whole minutes since the issue was created.
    pub time_to_fix: i64,
}

/// Who booked an appointment and when.
#[derive(Debug, Clone, PartialEq)]
pub struct Booking {
    pub by_id: Option<i64>,
    pub by_name: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleUpdate {
    pub date: Option<DateTime<Utc>>,
    pub status: ScheduleStatus,
    /// Set only when a new appointment is proposed.
    pub booking: Option<Booking>,
}

/// Lifecycle fields written by a commit. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleChange {
    pub status: Option<IssueStatus>,
    pub fix: Option<FixRecord>,
    pub schedule: Option<ScheduleUpdate>,
    pub final_cost: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleChange {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            status: None,
            fix: None,
            schedule: None,
            final_cost: None,
            updated_at,
        }
    }
}

/// One atomic lifecycle write: the issue fields plus the audit rows that
/// explain them. Applied only if the stored version still equals
/// `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueCommit {
    pub issue_id: i64,
    pub expected_version: i64,
    pub change: LifecycleChange,
    pub status_change: Option<NewStatusChange>,
    pub schedule_entry: Option<NewRepairScheduleHistory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub issue: Issue,
    pub status_change: Option<StatusChange>,
    pub schedule_entry: Option<RepairScheduleHistory>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Applied(Committed),
    /// Someone else wrote the issue since it was read.
    Conflict { current_version: i64 },
    NotFound,
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn get_issue(&self, id: i64) -> Result<Option<Issue>>;
    /// Newest first. `status` restricts the listing to one state.
    async fn list_issues(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>>;
    async fn issue_statistics(&self) -> Result<IssueStatistics>;
    async fn create_issue(&self, new: NewIssue) -> Result<Issue>;
    /// Edit descriptive fields. Returns `None` if the issue does not exist.
    async fn update_issue(&self, id: i64, patch: IssuePatch) -> Result<Option<Issue>>;
    /// Returns whether a row was deleted.
    async fn delete_issue(&self, id: i64) -> Result<bool>;

    async fn create_comment(&self, new: NewComment) -> Result<Comment>;
    async fn list_comments(&self, issue_id: i64) -> Result<Vec<Comment>>;

    async fn create_status_history(&self, new: NewStatusChange) -> Result<StatusChange>;
    async fn get_status_history(&self, issue_id: i64) -> Result<Vec<StatusChange>>;

    async fn create_repair_schedule_history(
        &self,
        new: NewRepairScheduleHistory,
    ) -> Result<RepairScheduleHistory>;
    async fn get_repair_schedule_history(&self, issue_id: i64) -> Result<Vec<RepairScheduleHistory>>;

    /// Apply a lifecycle write and its audit rows in one transaction.
    async fn commit(&self, commit: IssueCommit) -> Result<CommitResult>;
}
