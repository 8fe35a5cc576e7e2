use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary lifecycle state of an issue.
///
/// Every pair of states is a legal transition; the domain allows reverting
/// (e.g. `completed` back to `in_progress`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Pending,
    InProgress,
    Scheduled,
    Urgent,
    Completed,
    Fixed,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::Scheduled,
        Self::Urgent,
        Self::Completed,
        Self::Fixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Scheduled => "scheduled",
            Self::Urgent => "urgent",
            Self::Completed => "completed",
            Self::Fixed => "fixed",
        }
    }

    /// Entering one of these states stamps the fix fields on the issue.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Fixed)
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "scheduled" => Ok(Self::Scheduled),
            "urgent" => Ok(Self::Urgent),
            "completed" => Ok(Self::Completed),
            "fixed" => Ok(Self::Fixed),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// Negotiation state of a repair appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Proposed,
    Confirmed,
    Rescheduled,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Confirmed => "confirmed",
            Self::Rescheduled => "rescheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether an issue in this schedule state counts as having an active
    /// appointment. A cancelled schedule can be replaced by a new proposal.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Legal moves of the schedule sub-state machine.
    ///
    /// Staying in the same state is allowed (date-only change) unless the
    /// schedule is terminal. Any non-terminal state may jump to
    /// `rescheduled` or `cancelled`.
    pub fn can_transition_to(&self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        match (self, next) {
            (Completed, _) => false,
            (from, to) if *from == to => true,
            (_, Rescheduled) | (_, Cancelled) => true,
            (Proposed, Confirmed) | (Rescheduled, Confirmed) => true,
            (Confirmed, Completed) | (Rescheduled, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "confirmed" => Ok(Self::Confirmed),
            "rescheduled" => Ok(Self::Rescheduled),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid schedule status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Who performed a change. Both halves are optional because system-driven
/// transitions have no user attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: Option<i64>,
    pub name: Option<String>,
}

impl Actor {
    pub fn user(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: Some(name.into()),
        }
    }

    pub fn system() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub location: String,
    pub status: IssueStatus,
    pub priority: Priority,
    pub reporter_id: Option<i64>,
    pub reporter_name: Option<String>,
    pub fixed_by_id: Option<i64>,
    pub fixed_by_name: Option<String>,
    pub fixed_at: Option<DateTime<Utc>>,
    /// Minutes between creation and the most recent fix.
    pub time_to_fix: Option<i64>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub schedule_status: Option<ScheduleStatus>,
    pub scheduled_by_id: Option<i64>,
    pub scheduled_by_name: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub estimated_cost: Option<f64>,
    pub final_cost: Option<f64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when reporting a new issue. Lifecycle fields always start
/// at their initial values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIssue {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub priority: Priority,
    pub reporter_id: Option<i64>,
    pub reporter_name: Option<String>,
    pub estimated_cost: Option<f64>,
}

/// General-purpose edit. Deliberately carries no status or schedule fields:
/// those only change through the lifecycle so that every change is audited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub priority: Option<Priority>,
    pub estimated_cost: Option<f64>,
}

impl IssuePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Append-only audit row for a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub id: i64,
    pub issue_id: i64,
    pub old_status: IssueStatus,
    pub new_status: IssueStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStatusChange {
    pub issue_id: i64,
    pub old_status: IssueStatus,
    pub new_status: IssueStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Append-only audit row for a schedule change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairScheduleHistory {
    pub id: i64,
    pub issue_id: i64,
    pub old_schedule_date: Option<DateTime<Utc>>,
    pub new_schedule_date: Option<DateTime<Utc>>,
    pub old_status: Option<ScheduleStatus>,
    pub new_status: ScheduleStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRepairScheduleHistory {
    pub issue_id: i64,
    pub old_schedule_date: Option<DateTime<Utc>>,
    pub new_schedule_date: Option<DateTime<Utc>>,
    pub old_status: Option<ScheduleStatus>,
    pub new_status: ScheduleStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i64,
    pub issue_id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub issue_id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub content: String,
}

/// Aggregate counters over every issue. Open means not yet resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStatistics {
    pub total_issues: i64,
    pub open_issues: i64,
    pub fixed_issues: i64,
    /// Mean `time_to_fix` in minutes over resolved issues that carry one.
    pub average_fix_time: Option<f64>,
    pub most_reported_location: Option<String>,
    pub last_fix_date: Option<DateTime<Utc>>,
}
