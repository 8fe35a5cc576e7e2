//! Wire envelope and the closed message taxonomy shared by server and clients.
//!
//! Every frame on the socket is an [`Envelope`]:
//!
//! ```text
//! {"type":"status_changed","payload":{...},"timestamp":"2025-06-01T09:30:00Z","sender":{"id":5,"username":"tech"}}
//! ```
//!
//! The hub routes on [`MessageType`] only and treats `payload` as opaque JSON.
//! Server-side producers build envelopes from the typed [`Event`] union so that
//! each message type carries a well-defined payload.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Comment, Issue, RepairScheduleHistory, StatusChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    IssueCreated,
    IssueUpdated,
    IssueDeleted,
    CommentAdded,
    StatusChanged,
    RepairScheduled,
    LocationAdded,
    MachineAdded,
    UserLoggedIn,
    UserLoggedOut,
    Message,
    DataRefresh,
    MessageReceived,
    ConversationUpdated,
}

impl MessageType {
    pub const ALL: [MessageType; 14] = [
        Self::IssueCreated,
        Self::IssueUpdated,
        Self::IssueDeleted,
        Self::CommentAdded,
        Self::StatusChanged,
        Self::RepairScheduled,
        Self::LocationAdded,
        Self::MachineAdded,
        Self::UserLoggedIn,
        Self::UserLoggedOut,
        Self::Message,
        Self::DataRefresh,
        Self::MessageReceived,
        Self::ConversationUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueCreated => "issue_created",
            Self::IssueUpdated => "issue_updated",
            Self::IssueDeleted => "issue_deleted",
            Self::CommentAdded => "comment_added",
            Self::StatusChanged => "status_changed",
            Self::RepairScheduled => "repair_scheduled",
            Self::LocationAdded => "location_added",
            Self::MachineAdded => "machine_added",
            Self::UserLoggedIn => "user_logged_in",
            Self::UserLoggedOut => "user_logged_out",
            Self::Message => "message",
            Self::DataRefresh => "data_refresh",
            Self::MessageReceived => "message_received",
            Self::ConversationUpdated => "conversation_updated",
        }
    }

    /// Data-change notifications. These always fan out to every socket,
    /// the originator included.
    pub fn is_domain_event(&self) -> bool {
        matches!(
            self,
            Self::IssueCreated
                | Self::IssueUpdated
                | Self::IssueDeleted
                | Self::CommentAdded
                | Self::StatusChanged
                | Self::RepairScheduled
                | Self::LocationAdded
                | Self::MachineAdded
        )
    }

    /// Types a client may send to the server.
    pub fn accepted_inbound(&self) -> bool {
        *self == Self::UserLoggedIn || self.is_domain_event()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Invalid message type: {}", s))
    }
}

/// Identity stamped on client-originated (or attributed) messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderInfo>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Message is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Message has no 'type' field")]
    MissingType,

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Shape accepted from clients: `timestamp` and `payload` may be omitted.
#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: Option<Value>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: Option<SenderInfo>) -> Self {
        self.sender = sender;
        self
    }

    /// Plain `message` envelope carrying human-readable text.
    pub fn notice(text: impl Into<String>) -> Self {
        Self::new(
            MessageType::Message,
            serde_json::json!({ "message": text.into() }),
        )
    }

    /// `message` envelope reporting a problem with something the client sent.
    pub fn error_notice(text: impl Into<String>) -> Self {
        Self::new(
            MessageType::Message,
            serde_json::json!({ "error": text.into() }),
        )
    }

    /// Parse a client frame. Any sender the client claims is discarded; the
    /// server stamps identity from the authenticated socket instead.
    pub fn parse_inbound(text: &str) -> Result<Self, EnvelopeError> {
        let frame: InboundFrame = serde_json::from_str(text).map_err(EnvelopeError::Malformed)?;
        let kind = match frame.kind {
            Some(Value::String(s)) => {
                MessageType::from_str(&s).map_err(|_| EnvelopeError::UnknownType(s))?
            }
            Some(other) => return Err(EnvelopeError::UnknownType(other.to_string())),
            None => return Err(EnvelopeError::MissingType),
        };
        Ok(Self {
            kind,
            payload: frame.payload,
            timestamp: frame.timestamp.unwrap_or_else(Utc::now),
            sender: None,
        })
    }

    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }
}

// ── Typed payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRemoved {
    pub issue_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNotice {
    #[serde(flatten)]
    pub comment: Comment,
    pub issue_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleNotice {
    #[serde(flatten)]
    pub entry: RepairScheduleHistory,
    pub issue_title: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshHint {
    /// Which collection the client should re-fetch; `None` means everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed view of every message the system emits, one variant per
/// [`MessageType`]. Locations, machines and messaging live outside this
/// crate, so their payloads stay as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    IssueCreated(Issue),
    IssueUpdated(Issue),
    IssueDeleted(IssueRemoved),
    CommentAdded(CommentNotice),
    StatusChanged(StatusChange),
    RepairScheduled(ScheduleNotice),
    LocationAdded(Value),
    MachineAdded(Value),
    UserLoggedIn(Presence),
    UserLoggedOut(Presence),
    Message(Value),
    DataRefresh(RefreshHint),
    MessageReceived(Value),
    ConversationUpdated(Value),
}

impl Event {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::IssueCreated(_) => MessageType::IssueCreated,
            Self::IssueUpdated(_) => MessageType::IssueUpdated,
            Self::IssueDeleted(_) => MessageType::IssueDeleted,
            Self::CommentAdded(_) => MessageType::CommentAdded,
            Self::StatusChanged(_) => MessageType::StatusChanged,
            Self::RepairScheduled(_) => MessageType::RepairScheduled,
            Self::LocationAdded(_) => MessageType::LocationAdded,
            Self::MachineAdded(_) => MessageType::MachineAdded,
            Self::UserLoggedIn(_) => MessageType::UserLoggedIn,
            Self::UserLoggedOut(_) => MessageType::UserLoggedOut,
            Self::Message(_) => MessageType::Message,
            Self::DataRefresh(_) => MessageType::DataRefresh,
            Self::MessageReceived(_) => MessageType::MessageReceived,
            Self::ConversationUpdated(_) => MessageType::ConversationUpdated,
        }
    }

    pub fn into_envelope(self, sender: Option<SenderInfo>) -> Result<Envelope, EnvelopeError> {
        let kind = self.kind();
        let mut tagged = serde_json::to_value(&self).map_err(EnvelopeError::Encode)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Envelope::new(kind, payload).with_sender(sender))
    }

    /// Recover the typed event from an envelope. Fails when the payload does
    /// not match the schema for its type (e.g. a client sent free-form JSON).
    pub fn decode(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": envelope.kind,
            "payload": envelope.payload,
        }))
    }
}
