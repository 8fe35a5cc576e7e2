//! Handling of text frames received from a socket.
//!
//! Kept free of any transport type so the rules can be exercised with mock
//! sockets.

use tracing::{debug, warn};
use twinfix_common::envelope::Presence;
use twinfix_common::{Envelope, Event, MessageType};

use super::{Audience, ClientId, Hub, Identity};
use crate::errors::TrackerError;
use crate::events::EventBus;

pub const WELCOME_TEXT: &str = "Connected to Twin Fix real-time updates";

/// What an accepted frame led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Authenticated { user_id: i64 },
    Relayed { kind: MessageType, delivered: usize },
}

/// Apply one inbound frame.
///
/// * `user_logged_in` binds an identity to the socket and tells everyone
///   else about it.
/// * Domain events are stamped with the socket's identity, broadcast to all
///   sockets (sender included) and published on the in-process bus.
/// * Anything else is a validation error.
///
/// Only a frame that parses as an envelope counts as activity.
pub fn handle_client_text(
    hub: &Hub,
    bus: &EventBus,
    client: ClientId,
    text: &str,
) -> Result<InboundOutcome, TrackerError> {
    let mut envelope = Envelope::parse_inbound(text)?;
    hub.touch(client);

    if envelope.kind == MessageType::UserLoggedIn {
        let presence: Presence = serde_json::from_value(envelope.payload.clone()).map_err(|e| {
            TrackerError::Validation(format!("user_logged_in needs userId and username: {e}"))
        })?;
        let user_id = presence.user_id;
        hub.authenticate(client, Identity::from(presence.clone()))?;
        hub.broadcast_event(Event::UserLoggedIn(presence), None, Audience::Others(client));
        return Ok(InboundOutcome::Authenticated { user_id });
    }

    if !envelope.kind.accepted_inbound() {
        return Err(TrackerError::Validation(format!(
            "unsupported inbound message type '{}'",
            envelope.kind
        )));
    }

    envelope.sender = hub.sender_info(client);
    let report = hub.broadcast(&envelope, Audience::All);
    bus.publish(&envelope);
    debug!(client_id = %client, kind = %envelope.kind, "Relayed client event");
    Ok(InboundOutcome::Relayed {
        kind: envelope.kind,
        delivered: report.delivered.len(),
    })
}

/// [`handle_client_text`], reporting any failure back to the offending
/// socket only.
pub fn process_client_text(hub: &Hub, bus: &EventBus, client: ClientId, text: &str) {
    if let Err(e) = handle_client_text(hub, bus, client, text) {
        warn!(client_id = %client, error = %e, "Rejected client message");
        if let Err(send_err) = hub.send_to(client, &Envelope::error_notice(e.to_string())) {
            debug!(client_id = %client, error = %send_err, "Could not report error to client");
        }
    }
}

/// Greet a freshly registered socket.
pub fn send_welcome(hub: &Hub, client: ClientId) {
    if let Err(e) = hub.send_to(client, &Envelope::notice(WELCOME_TEXT)) {
        debug!(client_id = %client, error = %e, "Could not send welcome");
    }
}
