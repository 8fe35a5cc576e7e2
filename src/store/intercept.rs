//! Store decorator that announces every successful write to connected
//! clients. Reads pass straight through; a failed write publishes nothing.

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;
use twinfix_common::envelope::{CommentNotice, IssueRemoved, ScheduleNotice};
use twinfix_common::models::{
    Comment, NewComment, NewIssue, NewRepairScheduleHistory, NewStatusChange, RepairScheduleHistory,
    StatusChange,
};
use twinfix_common::{Event, Issue, IssuePatch, IssueStatistics, IssueStatus, SenderInfo};

use super::{CommitResult, IssueCommit, IssueStore};
use crate::events::Broadcaster;

pub struct BroadcastingStore<S> {
    inner: S,
    broadcaster: Broadcaster,
}

impl<S: IssueStore> BroadcastingStore<S> {
    pub fn new(inner: S, broadcaster: Broadcaster) -> Self {
        Self { inner, broadcaster }
    }

    fn emit(&self, event: Event, sender: Option<SenderInfo>) {
        self.broadcaster.publish(event, sender);
    }

    /// Look up the issue a notification refers to. A failed lookup only
    /// degrades the notification, it never fails the write.
    async fn context_issue(&self, issue_id: i64) -> Option<Issue> {
        match self.inner.get_issue(issue_id).await {
            Ok(issue) => issue,
            Err(e) => {
                warn!(issue_id, error = %e, "Could not load issue for notification");
                None
            }
        }
    }

    fn schedule_notice(entry: RepairScheduleHistory, issue: Option<&Issue>) -> ScheduleNotice {
        ScheduleNotice {
            entry,
            issue_title: issue.map(|i| i.title.clone()),
            location: issue.map(|i| i.location.clone()),
        }
    }
}

/// Sender attribution for server-originated events: present only when both
/// halves of the actor are known.
fn attribute(id: Option<i64>, name: Option<&str>) -> Option<SenderInfo> {
    Some(SenderInfo {
        id: id?,
        username: name?.to_string(),
        role: None,
    })
}

#[async_trait]
impl<S: IssueStore> IssueStore for BroadcastingStore<S> {
    async fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        self.inner.get_issue(id).await
    }

    async fn list_issues(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>> {
        self.inner.list_issues(status).await
    }

    async fn issue_statistics(&self) -> Result<IssueStatistics> {
        self.inner.issue_statistics().await
    }

    async fn create_issue(&self, new: NewIssue) -> Result<Issue> {
        let issue = self.inner.create_issue(new).await?;
        let sender = attribute(issue.reporter_id, issue.reporter_name.as_deref());
        self.emit(Event::IssueCreated(issue.clone()), sender);
        Ok(issue)
    }

    async fn update_issue(&self, id: i64, patch: IssuePatch) -> Result<Option<Issue>> {
        let updated = self.inner.update_issue(id, patch).await?;
        if let Some(issue) = &updated {
            self.emit(Event::IssueUpdated(issue.clone()), None);
        }
        Ok(updated)
    }

    async fn delete_issue(&self, id: i64) -> Result<bool> {
        let deleted = self.inner.delete_issue(id).await?;
        if deleted {
            self.emit(Event::IssueDeleted(IssueRemoved { issue_id: id }), None);
        }
        Ok(deleted)
    }

    async fn create_comment(&self, new: NewComment) -> Result<Comment> {
        let comment = self.inner.create_comment(new).await?;
        let issue = self.context_issue(comment.issue_id).await;
        let sender = attribute(comment.user_id, Some(comment.username.as_str()));
        self.emit(
            Event::CommentAdded(CommentNotice {
                comment: comment.clone(),
                issue_title: issue.map(|i| i.title),
            }),
            sender,
        );
        Ok(comment)
    }

    async fn list_comments(&self, issue_id: i64) -> Result<Vec<Comment>> {
        self.inner.list_comments(issue_id).await
    }

    async fn create_status_history(&self, new: NewStatusChange) -> Result<StatusChange> {
        let row = self.inner.create_status_history(new).await?;
        let sender = attribute(row.changed_by_id, row.changed_by_name.as_deref());
        self.emit(Event::StatusChanged(row.clone()), sender);
        Ok(row)
    }

    async fn get_status_history(&self, issue_id: i64) -> Result<Vec<StatusChange>> {
        self.inner.get_status_history(issue_id).await
    }

    async fn create_repair_schedule_history(
        &self,
        new: NewRepairScheduleHistory,
    ) -> Result<RepairScheduleHistory> {
        let entry = self.inner.create_repair_schedule_history(new).await?;
        let issue = self.context_issue(entry.issue_id).await;
        let sender = attribute(entry.changed_by_id, entry.changed_by_name.as_deref());
        self.emit(
            Event::RepairScheduled(Self::schedule_notice(entry.clone(), issue.as_ref())),
            sender,
        );
        Ok(entry)
    }

    async fn get_repair_schedule_history(&self, issue_id: i64) -> Result<Vec<RepairScheduleHistory>> {
        self.inner.get_repair_schedule_history(issue_id).await
    }

    /// One `issue_updated` carrying the final state, followed by one event
    /// per audit row written in the same transaction.
    async fn commit(&self, commit: IssueCommit) -> Result<CommitResult> {
        let result = self.inner.commit(commit).await?;
        if let CommitResult::Applied(committed) = &result {
            let sender = committed
                .status_change
                .as_ref()
                .and_then(|r| attribute(r.changed_by_id, r.changed_by_name.as_deref()))
                .or_else(|| {
                    committed
                        .schedule_entry
                        .as_ref()
                        .and_then(|e| attribute(e.changed_by_id, e.changed_by_name.as_deref()))
                });

            self.emit(Event::IssueUpdated(committed.issue.clone()), sender.clone());
            if let Some(row) = &committed.status_change {
                self.emit(Event::StatusChanged(row.clone()), sender.clone());
            }
            if let Some(entry) = &committed.schedule_entry {
                self.emit(
                    Event::RepairScheduled(Self::schedule_notice(entry.clone(), Some(&committed.issue))),
                    sender,
                );
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use twinfix_common::{IssueStatus, ScheduleStatus};

    use super::*;
    use crate::events::EventBus;
    use crate::hub::Hub;
    use crate::hub::testing::MockSocket;
    use crate::store::{LifecycleChange, SqliteStore};

    struct Fixture {
        store: BroadcastingStore<SqliteStore>,
        socket: MockSocket,
        _hub: Arc<Hub>,
    }

    fn fixture() -> Fixture {
        let hub = Arc::new(Hub::default());
        let socket = MockSocket::connect(&hub);
        let broadcaster = Broadcaster::new(Arc::clone(&hub), Arc::new(EventBus::new()));
        let store = BroadcastingStore::new(SqliteStore::in_memory().unwrap(), broadcaster);
        Fixture {
            store,
            socket,
            _hub: hub,
        }
    }

    fn new_issue(title: &str) -> NewIssue {
        NewIssue {
            title: title.to_string(),
            location: "Lab 2".to_string(),
            reporter_id: Some(4),
            reporter_name: Some("dana".to_string()),
            ..NewIssue::default()
        }
    }

    #[tokio::test]
    async fn create_issue_announces_with_reporter_as_sender() {
        let mut fx = fixture();
        let issue = fx.store.create_issue(new_issue("Projector")).await.unwrap();
        let frames = fx.socket.drain_json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "issue_created");
        assert_eq!(frames[0]["payload"]["id"], issue.id);
        assert_eq!(frames[0]["sender"]["username"], "dana");
    }

    #[tokio::test]
    async fn update_and_delete_announce_only_when_something_changed() {
        let mut fx = fixture();
        let issue = fx.store.create_issue(new_issue("Chair")).await.unwrap();
        fx.socket.drain_text();

        let patch = IssuePatch {
            title: Some("Office chair".to_string()),
            ..IssuePatch::default()
        };
        assert!(fx.store.update_issue(issue.id + 100, patch.clone()).await.unwrap().is_none());
        assert!(fx.socket.drain_text().is_empty());

        fx.store.update_issue(issue.id, patch).await.unwrap();
        assert_eq!(fx.socket.drain_types(), vec!["issue_updated"]);

        assert!(!fx.store.delete_issue(issue.id + 100).await.unwrap());
        assert!(fx.socket.drain_text().is_empty());

        assert!(fx.store.delete_issue(issue.id).await.unwrap());
        let frames = fx.socket.drain_json();
        assert_eq!(frames[0]["type"], "issue_deleted");
        assert_eq!(frames[0]["payload"]["issueId"], issue.id);
    }

    #[tokio::test]
    async fn comment_notice_carries_issue_title() {
        let mut fx = fixture();
        let issue = fx.store.create_issue(new_issue("Sink")).await.unwrap();
        fx.socket.drain_text();

        fx.store
            .create_comment(NewComment {
                issue_id: issue.id,
                user_id: Some(2),
                username: "bob".to_string(),
                content: "Dripping again".to_string(),
            })
            .await
            .unwrap();
        let frames = fx.socket.drain_json();
        assert_eq!(frames[0]["type"], "comment_added");
        assert_eq!(frames[0]["payload"]["content"], "Dripping again");
        assert_eq!(frames[0]["payload"]["issueTitle"], "Sink");
    }

    #[tokio::test]
    async fn failed_write_publishes_nothing() {
        let mut fx = fixture();
        let result = fx
            .store
            .create_status_history(NewStatusChange {
                issue_id: 404,
                old_status: IssueStatus::Pending,
                new_status: IssueStatus::Fixed,
                changed_by_id: None,
                changed_by_name: None,
                notes: None,
                changed_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
        assert!(fx.socket.drain_text().is_empty());
    }

    #[tokio::test]
    async fn schedule_history_notice_includes_location() {
        let mut fx = fixture();
        let issue = fx.store.create_issue(new_issue("Boiler")).await.unwrap();
        fx.socket.drain_text();

        fx.store
            .create_repair_schedule_history(NewRepairScheduleHistory {
                issue_id: issue.id,
                old_schedule_date: None,
                new_schedule_date: Some(Utc::now()),
                old_status: None,
                new_status: ScheduleStatus::Proposed,
                changed_by_id: Some(5),
                changed_by_name: Some("tech".to_string()),
                notes: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let frames = fx.socket.drain_json();
        assert_eq!(frames[0]["type"], "repair_scheduled");
        assert_eq!(frames[0]["payload"]["location"], "Lab 2");
        assert_eq!(frames[0]["payload"]["newStatus"], "proposed");
        assert_eq!(frames[0]["sender"]["id"], 5);
    }

    #[tokio::test]
    async fn commit_emits_one_issue_update_then_audit_events() {
        let mut fx = fixture();
        let issue = fx.store.create_issue(new_issue("Light")).await.unwrap();
        fx.socket.drain_text();

        let now = Utc::now();
        let mut change = LifecycleChange::at(now);
        change.status = Some(IssueStatus::Urgent);
        fx.store
            .commit(IssueCommit {
                issue_id: issue.id,
                expected_version: issue.version,
                change,
                status_change: Some(NewStatusChange {
                    issue_id: issue.id,
                    old_status: IssueStatus::Pending,
                    new_status: IssueStatus::Urgent,
                    changed_by_id: Some(1),
                    changed_by_name: Some("admin".to_string()),
                    notes: None,
                    changed_at: now,
                }),
                schedule_entry: None,
            })
            .await
            .unwrap();

        let frames = fx.socket.drain_json();
        let types: Vec<_> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["issue_updated", "status_changed"]);
        assert_eq!(frames[0]["payload"]["status"], "urgent");
        assert_eq!(frames[0]["sender"]["username"], "admin");
    }

    #[tokio::test]
    async fn conflicting_commit_is_silent() {
        let mut fx = fixture();
        let issue = fx.store.create_issue(new_issue("Vent")).await.unwrap();
        fx.socket.drain_text();

        let result = fx
            .store
            .commit(IssueCommit {
                issue_id: issue.id,
                expected_version: issue.version + 1,
                change: LifecycleChange::at(Utc::now()),
                status_change: None,
                schedule_entry: None,
            })
            .await
            .unwrap();
        assert!(matches!(result, CommitResult::Conflict { .. }));
        assert!(fx.socket.drain_text().is_empty());
    }
}
