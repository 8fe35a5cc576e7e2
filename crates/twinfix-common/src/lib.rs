//! Shared domain types for the Twin Fix repair tracker.
//!
//! `models` holds the issue record and its two append-only audit logs;
//! `envelope` holds the socket wire format and the closed message taxonomy.

pub mod envelope;
pub mod models;

pub use envelope::{Envelope, EnvelopeError, Event, MessageType, SenderInfo};
pub use models::{
    Actor, Issue, IssuePatch, IssueStatistics, IssueStatus, NewIssue, Priority, ScheduleStatus,
};
