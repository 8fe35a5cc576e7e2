//! Typed error hierarchy for the tracker core.
//!
//! `TrackerError` is what the lifecycle, the hub and the inbound socket
//! handler return. Storage backends speak `anyhow` internally and are folded
//! into `TrackerError::Store` at the lifecycle boundary.

use thiserror::Error;
use twinfix_common::EnvelopeError;

use crate::hub::ClientId;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Issue {id} not found")]
    IssueNotFound { id: i64 },

    #[error("Client {id} is not connected")]
    ClientNotFound { id: ClientId },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Failed to deliver to client {client}: {message}")]
    TransientIo { client: ClientId, message: String },

    #[error("Issue {id} was modified concurrently; gave up after {attempts} attempts")]
    Conflict { id: i64, attempts: u32 },

    #[error("Storage error: {0}")]
    Store(#[source] anyhow::Error),
}

impl TrackerError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

impl From<anyhow::Error> for TrackerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}

impl From<EnvelopeError> for TrackerError {
    fn from(err: EnvelopeError) -> Self {
        Self::Validation(err.to_string())
    }
}
