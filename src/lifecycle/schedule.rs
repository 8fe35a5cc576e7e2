//! Repair appointment sub-machine:
//! `proposed -> confirmed -> {rescheduled -> confirmed, completed, cancelled}`.
//!
//! A completed schedule is locked. Proposing a new appointment is only
//! allowed when there is none or the previous one was cancelled.

use chrono::{DateTime, Utc};
use twinfix_common::models::NewRepairScheduleHistory;
use twinfix_common::{Actor, Issue, IssueStatus, ScheduleStatus};

use super::{IssueLifecycle, plan_transition};
use crate::errors::TrackerError;
use crate::store::{Booking, IssueCommit, LifecycleChange, ScheduleUpdate};

const SCHEDULED_NOTE: &str = "Repair scheduled";
const CONFIRMED_NOTE: &str = "Repair date confirmed";
const COMPLETED_NOTE: &str = "Repair completed";

/// Requested change to an existing appointment. A missing date keeps the
/// current one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleChange {
    pub date: Option<DateTime<Utc>>,
    pub status: ScheduleStatus,
}

/// Both completion paths write the same note on their audit rows.
fn completion_note(notes: &Option<String>) -> Option<String> {
    Some(notes.clone().unwrap_or_else(|| COMPLETED_NOTE.to_string()))
}

fn history_row(
    issue: &Issue,
    new_date: Option<DateTime<Utc>>,
    new_status: ScheduleStatus,
    actor: &Actor,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> NewRepairScheduleHistory {
    NewRepairScheduleHistory {
        issue_id: issue.id,
        old_schedule_date: issue.scheduled_date,
        new_schedule_date: new_date,
        old_status: issue.schedule_status,
        new_status,
        changed_by_id: actor.id,
        changed_by_name: actor.name.clone(),
        notes,
        created_at: now,
    }
}

/// Plan a new appointment proposal.
pub fn plan_schedule(
    issue: &Issue,
    date: DateTime<Utc>,
    actor: &Actor,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Result<IssueCommit, TrackerError> {
    if let Some(current) = issue.schedule_status.filter(ScheduleStatus::is_active) {
        return Err(TrackerError::invalid_state(format!(
            "issue {} already has a {} repair schedule",
            issue.id, current
        )));
    }

    let mut change = LifecycleChange::at(now);
    change.schedule = Some(ScheduleUpdate {
        date: Some(date),
        status: ScheduleStatus::Proposed,
        booking: Some(Booking {
            by_id: actor.id,
            by_name: actor.name.clone(),
            at: now,
        }),
    });

    let status_change = if issue.status == IssueStatus::Pending {
        plan_transition(issue, IssueStatus::Scheduled, actor, Some(SCHEDULED_NOTE.to_string()), now)
            .map(|plan| plan.apply_to(&mut change))
    } else {
        None
    };

    Ok(IssueCommit {
        issue_id: issue.id,
        expected_version: issue.version,
        status_change,
        schedule_entry: Some(history_row(
            issue,
            Some(date),
            ScheduleStatus::Proposed,
            actor,
            Some(notes.unwrap_or_else(|| SCHEDULED_NOTE.to_string())),
            now,
        )),
        change,
    })
}

/// Plan a move of an existing appointment. `None` when neither the date nor
/// the status would change.
pub fn plan_schedule_update(
    issue: &Issue,
    requested: ScheduleChange,
    actor: &Actor,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Result<Option<IssueCommit>, TrackerError> {
    let Some(current) = issue.schedule_status else {
        return Err(TrackerError::invalid_state(format!(
            "issue {} has no repair schedule to update",
            issue.id
        )));
    };
    let date = requested.date.or(issue.scheduled_date);
    if date == issue.scheduled_date && requested.status == current {
        return Ok(None);
    }
    if !current.can_transition_to(requested.status) {
        return Err(TrackerError::invalid_state(format!(
            "repair schedule cannot move from {} to {}",
            current, requested.status
        )));
    }

    let mut change = LifecycleChange::at(now);
    change.schedule = Some(ScheduleUpdate {
        date,
        status: requested.status,
        booking: None,
    });

    let cascade = match requested.status {
        ScheduleStatus::Confirmed if issue.status != IssueStatus::InProgress => plan_transition(
            issue,
            IssueStatus::Scheduled,
            actor,
            Some(CONFIRMED_NOTE.to_string()),
            now,
        ),
        ScheduleStatus::Completed => {
            plan_transition(issue, IssueStatus::Fixed, actor, completion_note(&notes), now)
        }
        _ => None,
    };
    let status_change = cascade.map(|plan| plan.apply_to(&mut change));
    let notes = match requested.status {
        ScheduleStatus::Completed => completion_note(&notes),
        _ => notes,
    };

    Ok(Some(IssueCommit {
        issue_id: issue.id,
        expected_version: issue.version,
        status_change,
        schedule_entry: Some(history_row(issue, date, requested.status, actor, notes, now)),
        change,
    }))
}

/// Plan the close-out of a repair: the issue ends `fixed` with a completed
/// schedule whatever the schedule state was before.
pub fn plan_completion(
    issue: &Issue,
    actor: &Actor,
    final_cost: Option<f64>,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Option<IssueCommit> {
    let already_completed = issue.schedule_status == Some(ScheduleStatus::Completed);
    let cost_unchanged = final_cost.is_none_or(|cost| issue.final_cost == Some(cost));
    if already_completed && issue.status == IssueStatus::Fixed && cost_unchanged {
        return None;
    }

    let mut change = LifecycleChange::at(now);
    change.final_cost = final_cost;

    let schedule_entry = (!already_completed).then(|| {
        change.schedule = Some(ScheduleUpdate {
            date: issue.scheduled_date,
            status: ScheduleStatus::Completed,
            booking: None,
        });
        history_row(
            issue,
            issue.scheduled_date,
            ScheduleStatus::Completed,
            actor,
            completion_note(&notes),
            now,
        )
    });

    let status_change =
        plan_transition(issue, IssueStatus::Fixed, actor, completion_note(&notes), now)
            .map(|plan| plan.apply_to(&mut change));

    Some(IssueCommit {
        issue_id: issue.id,
        expected_version: issue.version,
        change,
        status_change,
        schedule_entry,
    })
}

impl IssueLifecycle {
    /// Propose a repair appointment. Moves a pending issue to `scheduled`
    /// in the same commit.
    pub async fn schedule_repair(
        &self,
        issue_id: i64,
        date: DateTime<Utc>,
        actor: Actor,
        notes: Option<String>,
    ) -> Result<Issue, TrackerError> {
        self.apply(issue_id, "schedule_repair", |issue, now| {
            plan_schedule(issue, date, &actor, notes.clone(), now).map(Some)
        })
        .await
    }

    /// Change the date and/or status of an existing appointment.
    pub async fn update_repair_schedule(
        &self,
        issue_id: i64,
        requested: ScheduleChange,
        actor: Actor,
        notes: Option<String>,
    ) -> Result<Issue, TrackerError> {
        self.apply(issue_id, "update_repair_schedule", |issue, now| {
            plan_schedule_update(issue, requested, &actor, notes.clone(), now)
        })
        .await
    }

    /// Close out a repair, optionally recording what it cost.
    pub async fn mark_repair_completed(
        &self,
        issue_id: i64,
        actor: Actor,
        final_cost: Option<f64>,
        notes: Option<String>,
    ) -> Result<Issue, TrackerError> {
        self.apply(issue_id, "mark_repair_completed", |issue, now| {
            Ok(plan_completion(issue, &actor, final_cost, notes.clone(), now))
        })
        .await
    }
}
