use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use twinfix_common::models::{
    Comment, NewComment, NewIssue, NewRepairScheduleHistory, NewStatusChange, RepairScheduleHistory,
    StatusChange,
};
use twinfix_common::{Issue, IssuePatch, IssueStatistics, IssueStatus, Priority, ScheduleStatus};

use super::{CommitResult, Committed, IssueCommit, IssueStore};
use crate::clock::{Clock, SystemClock};

/// Async-safe handle to the tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct TrackerDb {
    conn: Connection,
}

const ISSUE_COLUMNS: &str = "id, title, description, location, status, priority, reporter_id, reporter_name, \
     fixed_by_id, fixed_by_name, fixed_at, time_to_fix, scheduled_date, schedule_status, \
     scheduled_by_id, scheduled_by_name, scheduled_at, estimated_cost, final_cost, version, \
     created_at, updated_at";

/// SQL predicate for issues whose fix record has been stamped.
const RESOLVED: &str = "status IN ('completed', 'fixed')";

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    location TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    reporter_id INTEGER,
                    reporter_name TEXT,
                    fixed_by_id INTEGER,
                    fixed_by_name TEXT,
                    fixed_at TEXT,
                    time_to_fix INTEGER,
                    scheduled_date TEXT,
                    schedule_status TEXT,
                    scheduled_by_id INTEGER,
                    scheduled_by_name TEXT,
                    scheduled_at TEXT,
                    estimated_cost REAL,
                    final_cost REAL,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS status_changes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    old_status TEXT NOT NULL,
                    new_status TEXT NOT NULL,
                    changed_by_id INTEGER,
                    changed_by_name TEXT,
                    notes TEXT,
                    changed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS repair_schedule_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    old_schedule_date TEXT,
                    new_schedule_date TEXT,
                    old_status TEXT,
                    new_status TEXT NOT NULL,
                    changed_by_id INTEGER,
                    changed_by_name TEXT,
                    notes TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    user_id INTEGER,
                    username TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_status_changes_issue ON status_changes(issue_id);
                CREATE INDEX IF NOT EXISTS idx_schedule_history_issue ON repair_schedule_history(issue_id);
                CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    // ── Issues ───────────────────────────────────────────────────────

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
                params![id],
                IssueRow::read,
            )
            .optional()
            .context("Failed to query issue")?;
        row.map(IssueRow::into_issue).transpose()
    }

    /// Newest first, optionally only issues in `status`.
    pub fn list_issues(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC, id DESC"
            ))
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], IssueRow::read)
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            let r = row.context("Failed to read issue row")?;
            issues.push(r.into_issue()?);
        }
        Ok(issues)
    }

    pub fn issue_statistics(&self) -> Result<IssueStatistics> {
        let (total_issues, fixed_issues, average_fix_time, last_fix_date) = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN {RESOLVED} THEN 1 ELSE 0 END), 0),
                            AVG(CASE WHEN {RESOLVED} THEN time_to_fix END),
                            MAX(CASE WHEN {RESOLVED} THEN fixed_at END)
                     FROM issues"
                ),
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<DateTime<Utc>>>(3)?,
                    ))
                },
            )
            .context("Failed to aggregate issue statistics")?;

        // Ties go to the location reported first.
        let most_reported_location = self
            .conn
            .query_row(
                "SELECT location FROM issues
                 GROUP BY location
                 ORDER BY COUNT(*) DESC, MIN(id) ASC
                 LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query most reported location")?;

        Ok(IssueStatistics {
            total_issues,
            open_issues: total_issues - fixed_issues,
            fixed_issues,
            average_fix_time,
            most_reported_location,
            last_fix_date,
        })
    }

    pub fn create_issue(&self, new: &NewIssue, now: DateTime<Utc>) -> Result<Issue> {
        self.conn
            .execute(
                "INSERT INTO issues (title, description, location, priority, reporter_id, reporter_name, estimated_cost, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    new.title,
                    new.description,
                    new.location,
                    new.priority.as_str(),
                    new.reporter_id,
                    new.reporter_name,
                    new.estimated_cost,
                    now,
                ],
            )
            .context("Failed to insert issue")?;
        let id = self.conn.last_insert_rowid();
        self.get_issue(id)?.context("Issue not found after insert")
    }

    /// Apply descriptive edits and bump the version. An empty patch is a
    /// read.
    pub fn update_issue(&self, id: i64, patch: &IssuePatch, now: DateTime<Utc>) -> Result<Option<Issue>> {
        if self.get_issue(id)?.is_none() {
            return Ok(None);
        }
        if patch.is_empty() {
            return self.get_issue(id);
        }

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(t) = &patch.title {
            tx.execute("UPDATE issues SET title = ?1 WHERE id = ?2", params![t, id])
                .context("Failed to update issue title")?;
        }
        if let Some(d) = &patch.description {
            tx.execute("UPDATE issues SET description = ?1 WHERE id = ?2", params![d, id])
                .context("Failed to update issue description")?;
        }
        if let Some(l) = &patch.location {
            tx.execute("UPDATE issues SET location = ?1 WHERE id = ?2", params![l, id])
                .context("Failed to update issue location")?;
        }
        if let Some(p) = patch.priority {
            tx.execute("UPDATE issues SET priority = ?1 WHERE id = ?2", params![p.as_str(), id])
                .context("Failed to update issue priority")?;
        }
        if let Some(c) = patch.estimated_cost {
            tx.execute("UPDATE issues SET estimated_cost = ?1 WHERE id = ?2", params![c, id])
                .context("Failed to update estimated cost")?;
        }
        tx.execute(
            "UPDATE issues SET version = version + 1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .context("Failed to bump issue version")?;

        tx.commit().context("Failed to commit issue update")?;
        self.get_issue(id)
    }

    /// Deleting an issue cascades to its comments and audit rows.
    pub fn delete_issue(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM issues WHERE id = ?1", params![id])
            .context("Failed to delete issue")?;
        Ok(count > 0)
    }

    /// Apply a lifecycle commit atomically, guarded by the issue version.
    pub fn commit(&self, commit: &IssueCommit) -> Result<CommitResult> {
        let id = commit.issue_id;
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let current: Option<i64> = tx
            .query_row("SELECT version FROM issues WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to read issue version")?;
        let Some(current) = current else {
            return Ok(CommitResult::NotFound);
        };
        if current != commit.expected_version {
            return Ok(CommitResult::Conflict {
                current_version: current,
            });
        }

        let change = &commit.change;
        if let Some(status) = change.status {
            tx.execute(
                "UPDATE issues SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update issue status")?;
        }
        if let Some(fix) = &change.fix {
            tx.execute(
                "UPDATE issues SET fixed_by_id = ?1, fixed_by_name = ?2, fixed_at = ?3, time_to_fix = ?4 WHERE id = ?5",
                params![fix.by_id, fix.by_name, fix.at, fix.time_to_fix, id],
            )
            .context("Failed to record fix")?;
        }
        if let Some(schedule) = &change.schedule {
            tx.execute(
                "UPDATE issues SET scheduled_date = ?1, schedule_status = ?2 WHERE id = ?3",
                params![schedule.date, schedule.status.as_str(), id],
            )
            .context("Failed to update schedule")?;
            if let Some(booking) = &schedule.booking {
                tx.execute(
                    "UPDATE issues SET scheduled_by_id = ?1, scheduled_by_name = ?2, scheduled_at = ?3 WHERE id = ?4",
                    params![booking.by_id, booking.by_name, booking.at, id],
                )
                .context("Failed to record booking")?;
            }
        }
        if let Some(cost) = change.final_cost {
            tx.execute("UPDATE issues SET final_cost = ?1 WHERE id = ?2", params![cost, id])
                .context("Failed to update final cost")?;
        }
        tx.execute(
            "UPDATE issues SET version = version + 1, updated_at = ?1 WHERE id = ?2",
            params![change.updated_at, id],
        )
        .context("Failed to bump issue version")?;

        let status_change = commit
            .status_change
            .as_ref()
            .map(|new| insert_status_change(&tx, new))
            .transpose()?;
        let schedule_entry = commit
            .schedule_entry
            .as_ref()
            .map(|new| insert_schedule_history(&tx, new))
            .transpose()?;

        tx.commit().context("Failed to commit lifecycle change")?;

        let issue = self
            .get_issue(id)?
            .context("Issue not found after commit")?;
        Ok(CommitResult::Applied(Committed {
            issue,
            status_change,
            schedule_entry,
        }))
    }

    // ── Comments ─────────────────────────────────────────────────────

    pub fn create_comment(&self, new: &NewComment, now: DateTime<Utc>) -> Result<Comment> {
        self.conn
            .execute(
                "INSERT INTO comments (issue_id, user_id, username, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new.issue_id, new.user_id, new.username, new.content, now],
            )
            .context("Failed to insert comment")?;
        Ok(Comment {
            id: self.conn.last_insert_rowid(),
            issue_id: new.issue_id,
            user_id: new.user_id,
            username: new.username.clone(),
            content: new.content.clone(),
            created_at: now,
        })
    }

    /// Oldest first, so a thread reads top to bottom.
    pub fn list_comments(&self, issue_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_id, user_id, username, content, created_at
                 FROM comments WHERE issue_id = ?1 ORDER BY created_at, id",
            )
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![issue_id], |row| {
                Ok(Comment {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    user_id: row.get(2)?,
                    username: row.get(3)?,
                    content: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query comments")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read comment row")
    }

    // ── Audit trails ─────────────────────────────────────────────────

    pub fn create_status_history(&self, new: &NewStatusChange) -> Result<StatusChange> {
        insert_status_change(&self.conn, new)
    }

    /// Newest first.
    pub fn get_status_history(&self, issue_id: i64) -> Result<Vec<StatusChange>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_id, old_status, new_status, changed_by_id, changed_by_name, notes, changed_at
                 FROM status_changes WHERE issue_id = ?1 ORDER BY changed_at DESC, id DESC",
            )
            .context("Failed to prepare get_status_history")?;
        let rows = stmt
            .query_map(params![issue_id], |row| {
                Ok(StatusChangeRow {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    old_status: row.get(2)?,
                    new_status: row.get(3)?,
                    changed_by_id: row.get(4)?,
                    changed_by_name: row.get(5)?,
                    notes: row.get(6)?,
                    changed_at: row.get(7)?,
                })
            })
            .context("Failed to query status history")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read status change row")?.into_status_change()?);
        }
        Ok(out)
    }

    pub fn create_repair_schedule_history(
        &self,
        new: &NewRepairScheduleHistory,
    ) -> Result<RepairScheduleHistory> {
        insert_schedule_history(&self.conn, new)
    }

    /// Newest first.
    pub fn get_repair_schedule_history(&self, issue_id: i64) -> Result<Vec<RepairScheduleHistory>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_id, old_schedule_date, new_schedule_date, old_status, new_status,
                        changed_by_id, changed_by_name, notes, created_at
                 FROM repair_schedule_history WHERE issue_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .context("Failed to prepare get_repair_schedule_history")?;
        let rows = stmt
            .query_map(params![issue_id], |row| {
                Ok(ScheduleHistoryRow {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    old_schedule_date: row.get(2)?,
                    new_schedule_date: row.get(3)?,
                    old_status: row.get(4)?,
                    new_status: row.get(5)?,
                    changed_by_id: row.get(6)?,
                    changed_by_name: row.get(7)?,
                    notes: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query schedule history")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read schedule history row")?.into_entry()?);
        }
        Ok(out)
    }
}

fn insert_status_change(conn: &Connection, new: &NewStatusChange) -> Result<StatusChange> {
    conn.execute(
        "INSERT INTO status_changes (issue_id, old_status, new_status, changed_by_id, changed_by_name, notes, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new.issue_id,
            new.old_status.as_str(),
            new.new_status.as_str(),
            new.changed_by_id,
            new.changed_by_name,
            new.notes,
            new.changed_at,
        ],
    )
    .context("Failed to insert status change")?;
    Ok(StatusChange {
        id: conn.last_insert_rowid(),
        issue_id: new.issue_id,
        old_status: new.old_status,
        new_status: new.new_status,
        changed_by_id: new.changed_by_id,
        changed_by_name: new.changed_by_name.clone(),
        notes: new.notes.clone(),
        changed_at: new.changed_at,
    })
}

fn insert_schedule_history(
    conn: &Connection,
    new: &NewRepairScheduleHistory,
) -> Result<RepairScheduleHistory> {
    conn.execute(
        "INSERT INTO repair_schedule_history
            (issue_id, old_schedule_date, new_schedule_date, old_status, new_status, changed_by_id, changed_by_name, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            new.issue_id,
            new.old_schedule_date,
            new.new_schedule_date,
            new.old_status.map(|s| s.as_str()),
            new.new_status.as_str(),
            new.changed_by_id,
            new.changed_by_name,
            new.notes,
            new.created_at,
        ],
    )
    .context("Failed to insert schedule history")?;
    Ok(RepairScheduleHistory {
        id: conn.last_insert_rowid(),
        issue_id: new.issue_id,
        old_schedule_date: new.old_schedule_date,
        new_schedule_date: new.new_schedule_date,
        old_status: new.old_status,
        new_status: new.new_status,
        changed_by_id: new.changed_by_id,
        changed_by_name: new.changed_by_name.clone(),
        notes: new.notes.clone(),
        created_at: new.created_at,
    })
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Failed to parse {what}"))
}

// ── Row types ────────────────────────────────────────────────────────

struct IssueRow {
    id: i64,
    title: String,
    description: String,
    location: String,
    status: String,
    priority: String,
    reporter_id: Option<i64>,
    reporter_name: Option<String>,
    fixed_by_id: Option<i64>,
    fixed_by_name: Option<String>,
    fixed_at: Option<DateTime<Utc>>,
    time_to_fix: Option<i64>,
    scheduled_date: Option<DateTime<Utc>>,
    schedule_status: Option<String>,
    scheduled_by_id: Option<i64>,
    scheduled_by_name: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    estimated_cost: Option<f64>,
    final_cost: Option<f64>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IssueRow {
    /// Column order matches [`ISSUE_COLUMNS`].
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            location: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            reporter_id: row.get(6)?,
            reporter_name: row.get(7)?,
            fixed_by_id: row.get(8)?,
            fixed_by_name: row.get(9)?,
            fixed_at: row.get(10)?,
            time_to_fix: row.get(11)?,
            scheduled_date: row.get(12)?,
            schedule_status: row.get(13)?,
            scheduled_by_id: row.get(14)?,
            scheduled_by_name: row.get(15)?,
            scheduled_at: row.get(16)?,
            estimated_cost: row.get(17)?,
            final_cost: row.get(18)?,
            version: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }

    fn into_issue(self) -> Result<Issue> {
        let status: IssueStatus = parse_enum(&self.status, "issue status")?;
        let priority: Priority = parse_enum(&self.priority, "issue priority")?;
        let schedule_status = self
            .schedule_status
            .as_deref()
            .map(|s| parse_enum::<ScheduleStatus>(s, "schedule status"))
            .transpose()?;

        Ok(Issue {
            id: self.id,
            title: self.title,
            description: self.description,
            location: self.location,
            status,
            priority,
            reporter_id: self.reporter_id,
            reporter_name: self.reporter_name,
            fixed_by_id: self.fixed_by_id,
            fixed_by_name: self.fixed_by_name,
            fixed_at: self.fixed_at,
            time_to_fix: self.time_to_fix,
            scheduled_date: self.scheduled_date,
            schedule_status,
            scheduled_by_id: self.scheduled_by_id,
            scheduled_by_name: self.scheduled_by_name,
            scheduled_at: self.scheduled_at,
            estimated_cost: self.estimated_cost,
            final_cost: self.final_cost,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct StatusChangeRow {
    id: i64,
    issue_id: i64,
    old_status: String,
    new_status: String,
    changed_by_id: Option<i64>,
    changed_by_name: Option<String>,
    notes: Option<String>,
    changed_at: DateTime<Utc>,
}

impl StatusChangeRow {
    fn into_status_change(self) -> Result<StatusChange> {
        Ok(StatusChange {
            id: self.id,
            issue_id: self.issue_id,
            old_status: parse_enum(&self.old_status, "old status")?,
            new_status: parse_enum(&self.new_status, "new status")?,
            changed_by_id: self.changed_by_id,
            changed_by_name: self.changed_by_name,
            notes: self.notes,
            changed_at: self.changed_at,
        })
    }
}

struct ScheduleHistoryRow {
    id: i64,
    issue_id: i64,
    old_schedule_date: Option<DateTime<Utc>>,
    new_schedule_date: Option<DateTime<Utc>>,
    old_status: Option<String>,
    new_status: String,
    changed_by_id: Option<i64>,
    changed_by_name: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl ScheduleHistoryRow {
    fn into_entry(self) -> Result<RepairScheduleHistory> {
        Ok(RepairScheduleHistory {
            id: self.id,
            issue_id: self.issue_id,
            old_schedule_date: self.old_schedule_date,
            new_schedule_date: self.new_schedule_date,
            old_status: self
                .old_status
                .as_deref()
                .map(|s| parse_enum(s, "old schedule status"))
                .transpose()?,
            new_status: parse_enum(&self.new_status, "new schedule status")?,
            changed_by_id: self.changed_by_id,
            changed_by_name: self.changed_by_name,
            notes: self.notes,
            created_at: self.created_at,
        })
    }
}

// ── Async store ──────────────────────────────────────────────────────

/// [`IssueStore`] backed by SQLite through a [`DbHandle`].
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp creation and edit times from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(DbHandle::new(TrackerDb::new(path)?)))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(DbHandle::new(TrackerDb::new_in_memory()?)))
    }
}

#[async_trait]
impl IssueStore for SqliteStore {
    async fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        self.db.call(move |db| db.get_issue(id)).await
    }

    async fn list_issues(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>> {
        self.db.call(move |db| db.list_issues(status)).await
    }

    async fn issue_statistics(&self) -> Result<IssueStatistics> {
        self.db.call(|db| db.issue_statistics()).await
    }

    async fn create_issue(&self, new: NewIssue) -> Result<Issue> {
        let now = self.clock.now();
        self.db.call(move |db| db.create_issue(&new, now)).await
    }

    async fn update_issue(&self, id: i64, patch: IssuePatch) -> Result<Option<Issue>> {
        let now = self.clock.now();
        self.db.call(move |db| db.update_issue(id, &patch, now)).await
    }

    async fn delete_issue(&self, id: i64) -> Result<bool> {
        self.db.call(move |db| db.delete_issue(id)).await
    }

    async fn create_comment(&self, new: NewComment) -> Result<Comment> {
        let now = self.clock.now();
        self.db.call(move |db| db.create_comment(&new, now)).await
    }

    async fn list_comments(&self, issue_id: i64) -> Result<Vec<Comment>> {
        self.db.call(move |db| db.list_comments(issue_id)).await
    }

    async fn create_status_history(&self, new: NewStatusChange) -> Result<StatusChange> {
        self.db.call(move |db| db.create_status_history(&new)).await
    }

    async fn get_status_history(&self, issue_id: i64) -> Result<Vec<StatusChange>> {
        self.db.call(move |db| db.get_status_history(issue_id)).await
    }

    async fn create_repair_schedule_history(
        &self,
        new: NewRepairScheduleHistory,
    ) -> Result<RepairScheduleHistory> {
        self.db
            .call(move |db| db.create_repair_schedule_history(&new))
            .await
    }

    async fn get_repair_schedule_history(&self, issue_id: i64) -> Result<Vec<RepairScheduleHistory>> {
        self.db
            .call(move |db| db.get_repair_schedule_history(issue_id))
            .await
    }

    async fn commit(&self, commit: IssueCommit) -> Result<CommitResult> {
        self.db.call(move |db| db.commit(&commit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FixRecord, LifecycleChange};
    use chrono::Duration;

    fn new_issue(title: &str) -> NewIssue {
        NewIssue {
            title: title.to_string(),
            location: "Block A".to_string(),
            reporter_id: Some(1),
            reporter_name: Some("alice".to_string()),
            ..NewIssue::default()
        }
    }

    fn status_row(issue_id: i64, from: IssueStatus, to: IssueStatus, at: DateTime<Utc>) -> NewStatusChange {
        NewStatusChange {
            issue_id,
            old_status: from,
            new_status: to,
            changed_by_id: Some(5),
            changed_by_name: Some("tech".to_string()),
            notes: None,
            changed_at: at,
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('issues', 'status_changes', 'repair_schedule_history', 'comments')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 4);
        Ok(())
    }

    #[test]
    fn test_file_database_persists_across_opens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tracker.db");
        {
            let db = TrackerDb::new(&path)?;
            db.create_issue(&new_issue("Leaking tap"), Utc::now())?;
        }
        let db = TrackerDb::new(&path)?;
        let issues = db.list_issues(None)?;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Leaking tap");
        Ok(())
    }

    #[test]
    fn test_create_issue_starts_pending_at_version_one() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let now = Utc::now();
        let issue = db.create_issue(&new_issue("Broken window"), now)?;
        assert_eq!(issue.status, IssueStatus::Pending);
        assert_eq!(issue.priority, Priority::Medium);
        assert_eq!(issue.version, 1);
        assert_eq!(issue.created_at, now);
        assert_eq!(issue.reporter_name.as_deref(), Some("alice"));
        assert!(issue.schedule_status.is_none());
        assert!(issue.fixed_at.is_none());
        Ok(())
    }

    #[test]
    fn test_list_issues_newest_first() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let t0 = Utc::now();
        db.create_issue(&new_issue("old"), t0)?;
        db.create_issue(&new_issue("new"), t0 + Duration::minutes(1))?;
        let titles: Vec<_> = db.list_issues(None)?.into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["new", "old"]);
        Ok(())
    }

    fn resolve(db: &TrackerDb, issue: &Issue, to: IssueStatus, minutes: i64) -> Result<()> {
        let at = issue.created_at + Duration::minutes(minutes);
        let mut change = LifecycleChange::at(at);
        change.status = Some(to);
        if to.is_resolved() {
            change.fix = Some(FixRecord {
                by_id: Some(5),
                by_name: Some("tech".to_string()),
                at,
                time_to_fix: minutes,
            });
        }
        match db.commit(&IssueCommit {
            issue_id: issue.id,
            expected_version: issue.version,
            change,
            status_change: Some(status_row(issue.id, issue.status, to, at)),
            schedule_entry: None,
        })? {
            CommitResult::Applied(_) => Ok(()),
            other => Err(anyhow!("commit not applied: {other:?}")),
        }
    }

    #[test]
    fn test_list_issues_filters_by_status() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let t0 = Utc::now();
        let tap = db.create_issue(&new_issue("Tap"), t0)?;
        db.create_issue(&new_issue("Door"), t0)?;
        resolve(&db, &tap, IssueStatus::Urgent, 5)?;

        let urgent = db.list_issues(Some(IssueStatus::Urgent))?;
        assert_eq!(urgent.len(), 1);
        assert_eq!(urgent[0].title, "Tap");
        assert_eq!(db.list_issues(Some(IssueStatus::Pending))?[0].title, "Door");
        assert!(db.list_issues(Some(IssueStatus::Fixed))?.is_empty());
        assert_eq!(db.list_issues(None)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_statistics_on_empty_database() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        assert_eq!(db.issue_statistics()?, IssueStatistics::default());
        Ok(())
    }

    #[test]
    fn test_statistics_split_open_and_fixed_and_average_fix_time() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let t0 = Utc::now();
        let mut gym = new_issue("Treadmill");
        gym.location = "Gym".to_string();
        let treadmill = db.create_issue(&gym, t0)?;
        let rowing = db.create_issue(&NewIssue { title: "Rowing machine".to_string(), ..gym.clone() }, t0)?;
        let window = db.create_issue(&new_issue("Window"), t0)?;
        db.create_issue(&new_issue("Heater"), t0)?;
        db.create_issue(&NewIssue { title: "Bench".to_string(), ..gym }, t0)?;

        resolve(&db, &treadmill, IssueStatus::Fixed, 30)?;
        resolve(&db, &rowing, IssueStatus::Completed, 90)?;
        // Not resolved, so neither counted as fixed nor averaged.
        resolve(&db, &window, IssueStatus::InProgress, 600)?;

        let stats = db.issue_statistics()?;
        assert_eq!(stats.total_issues, 5);
        assert_eq!(stats.fixed_issues, 2);
        assert_eq!(stats.open_issues, 3);
        assert_eq!(stats.average_fix_time, Some(60.0));
        assert_eq!(stats.most_reported_location.as_deref(), Some("Gym"));
        assert_eq!(stats.last_fix_date, Some(t0 + Duration::minutes(90)));
        Ok(())
    }

    #[test]
    fn test_update_issue_bumps_version() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let issue = db.create_issue(&new_issue("Door"), Utc::now())?;
        let patch = IssuePatch {
            title: Some("Front door".to_string()),
            priority: Some(Priority::High),
            ..IssuePatch::default()
        };
        let updated = db.update_issue(issue.id, &patch, Utc::now())?.unwrap();
        assert_eq!(updated.title, "Front door");
        assert_eq!(updated.priority, Priority::High);
        assert_eq!(updated.location, "Block A");
        assert_eq!(updated.version, 2);
        Ok(())
    }

    #[test]
    fn test_update_missing_issue_returns_none() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let patch = IssuePatch {
            title: Some("x".to_string()),
            ..IssuePatch::default()
        };
        assert!(db.update_issue(99, &patch, Utc::now())?.is_none());
        Ok(())
    }

    #[test]
    fn test_empty_patch_leaves_version() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let issue = db.create_issue(&new_issue("Door"), Utc::now())?;
        let same = db.update_issue(issue.id, &IssuePatch::default(), Utc::now())?.unwrap();
        assert_eq!(same.version, 1);
        Ok(())
    }

    #[test]
    fn test_delete_issue_cascades_to_history() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let now = Utc::now();
        let issue = db.create_issue(&new_issue("Lamp"), now)?;
        db.create_status_history(&status_row(issue.id, IssueStatus::Pending, IssueStatus::Urgent, now))?;
        db.create_comment(
            &NewComment {
                issue_id: issue.id,
                user_id: Some(2),
                username: "bob".to_string(),
                content: "still broken".to_string(),
            },
            now,
        )?;

        assert!(db.delete_issue(issue.id)?);
        assert!(!db.delete_issue(issue.id)?);
        assert!(db.get_status_history(issue.id)?.is_empty());
        assert!(db.list_comments(issue.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_status_history_for_unknown_issue_fails() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let result = db.create_status_history(&status_row(
            42,
            IssueStatus::Pending,
            IssueStatus::Fixed,
            Utc::now(),
        ));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_history_is_newest_first() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let t0 = Utc::now();
        let issue = db.create_issue(&new_issue("Heater"), t0)?;
        db.create_status_history(&status_row(issue.id, IssueStatus::Pending, IssueStatus::InProgress, t0))?;
        db.create_status_history(&status_row(
            issue.id,
            IssueStatus::InProgress,
            IssueStatus::Fixed,
            t0 + Duration::minutes(5),
        ))?;
        let history = db.get_status_history(issue.id)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].new_status, IssueStatus::Fixed);
        assert_eq!(history[1].new_status, IssueStatus::InProgress);
        Ok(())
    }

    #[test]
    fn test_commit_applies_fields_and_audit_rows() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let t0 = Utc::now();
        let issue = db.create_issue(&new_issue("Pipe"), t0)?;
        let t1 = t0 + Duration::minutes(90);

        let mut change = LifecycleChange::at(t1);
        change.status = Some(IssueStatus::Fixed);
        change.fix = Some(FixRecord {
            by_id: Some(5),
            by_name: Some("tech".to_string()),
            at: t1,
            time_to_fix: 90,
        });
        let result = db.commit(&IssueCommit {
            issue_id: issue.id,
            expected_version: issue.version,
            change,
            status_change: Some(status_row(issue.id, IssueStatus::Pending, IssueStatus::Fixed, t1)),
            schedule_entry: None,
        })?;

        let committed = match result {
            CommitResult::Applied(committed) => committed,
            other => panic!("Expected Applied, got {other:?}"),
        };
        assert_eq!(committed.issue.status, IssueStatus::Fixed);
        assert_eq!(committed.issue.fixed_at, Some(t1));
        assert_eq!(committed.issue.time_to_fix, Some(90));
        assert_eq!(committed.issue.version, 2);
        assert_eq!(committed.issue.updated_at, t1);
        let row = committed.status_change.unwrap();
        assert!(row.id > 0);
        assert_eq!(db.get_status_history(issue.id)?, vec![row]);
        Ok(())
    }

    #[test]
    fn test_commit_with_stale_version_conflicts_and_writes_nothing() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let now = Utc::now();
        let issue = db.create_issue(&new_issue("Fan"), now)?;
        db.update_issue(
            issue.id,
            &IssuePatch {
                title: Some("Ceiling fan".to_string()),
                ..IssuePatch::default()
            },
            now,
        )?;

        let mut change = LifecycleChange::at(now);
        change.status = Some(IssueStatus::Urgent);
        let result = db.commit(&IssueCommit {
            issue_id: issue.id,
            expected_version: 1,
            change,
            status_change: Some(status_row(issue.id, IssueStatus::Pending, IssueStatus::Urgent, now)),
            schedule_entry: None,
        })?;
        assert_eq!(result, CommitResult::Conflict { current_version: 2 });
        assert_eq!(db.get_issue(issue.id)?.unwrap().status, IssueStatus::Pending);
        assert!(db.get_status_history(issue.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_commit_on_missing_issue() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let result = db.commit(&IssueCommit {
            issue_id: 3,
            expected_version: 1,
            change: LifecycleChange::at(Utc::now()),
            status_change: None,
            schedule_entry: None,
        })?;
        assert_eq!(result, CommitResult::NotFound);
        Ok(())
    }

    #[test]
    fn test_comments_oldest_first() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let t0 = Utc::now();
        let issue = db.create_issue(&new_issue("Sink"), t0)?;
        for (i, text) in ["first", "second"].iter().enumerate() {
            db.create_comment(
                &NewComment {
                    issue_id: issue.id,
                    user_id: None,
                    username: "guest".to_string(),
                    content: text.to_string(),
                },
                t0 + Duration::seconds(i as i64),
            )?;
        }
        let contents: Vec<_> = db
            .list_comments(issue.id)?
            .into_iter()
            .map(|c| c.content)
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trips_through_handle() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let created = store.create_issue(new_issue("Gate")).await?;
        let fetched = store.get_issue(created.id).await?.unwrap();
        assert_eq!(fetched, created);
        assert!(store.get_issue(created.id + 1).await?.is_none());
        assert_eq!(store.list_issues(None).await?.len(), 1);
        Ok(())
    }
}
