//! Real-time hub: tracks every connected socket and fans envelopes out to
//! them.
//!
//! Each socket owns a bounded outbound queue drained by its own writer task
//! (see `server::ws`). Broadcasting serializes the envelope once, snapshots
//! the recipient handles under the registry lock, then enqueues without
//! waiting. A slow or dead socket only loses its own frame; the failure is
//! logged and the remaining recipients are unaffected.

pub mod inbound;
pub mod liveness;
pub mod registry;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use twinfix_common::envelope::Presence;
use twinfix_common::{Envelope, Event, SenderInfo};

use crate::errors::TrackerError;

pub use registry::{ClientConnection, ClientHandle, ClientId, ClientInfo, Identity, Outbound};

/// Interval between liveness sweeps.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A socket with no inbound application message for this long is evicted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Per-socket outbound queue depth.
pub const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            outbound_buffer: OUTBOUND_BUFFER,
        }
    }
}

/// Which sockets a broadcast targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    /// Everyone except the originating socket.
    Others(ClientId),
    /// Authenticated sockets whose user id is listed.
    Users(Vec<i64>),
    /// Authenticated sockets whose role is listed.
    Roles(Vec<String>),
}

impl Audience {
    pub fn includes(&self, id: ClientId, identity: Option<&Identity>) -> bool {
        match self {
            Self::All => true,
            Self::Others(origin) => id != *origin,
            Self::Users(users) => identity.is_some_and(|i| users.contains(&i.user_id)),
            Self::Roles(roles) => identity
                .and_then(|i| i.role.as_deref())
                .is_some_and(|role| roles.iter().any(|r| r == role)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<ClientId>,
    pub failed: Vec<ClientId>,
}

pub struct Hub {
    registry: Mutex<registry::Registry>,
    settings: HubSettings,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            registry: Mutex::new(registry::Registry::default()),
            settings,
        }
    }

    pub fn shared(settings: HubSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    // A panic while holding the lock leaves the map itself consistent, so a
    // poisoned mutex is still safe to use.
    fn registry(&self) -> MutexGuard<'_, registry::Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: ClientHandle) -> ClientId {
        let (id, total) = {
            let mut reg = self.registry();
            let id = reg.insert(handle, Instant::now());
            (id, reg.len())
        };
        info!(client_id = %id, connections = total, "Client connected");
        id
    }

    /// Bind an identity to a socket. Re-authenticating replaces the previous
    /// identity.
    pub fn authenticate(&self, id: ClientId, identity: Identity) -> Result<(), TrackerError> {
        let username = identity.username.clone();
        if !self.registry().set_identity(id, identity) {
            return Err(TrackerError::ClientNotFound { id });
        }
        info!(client_id = %id, user = %username, "Client authenticated");
        Ok(())
    }

    pub fn identity(&self, id: ClientId) -> Option<Identity> {
        self.registry().get(id).and_then(|conn| conn.identity.clone())
    }

    pub fn sender_info(&self, id: ClientId) -> Option<SenderInfo> {
        self.identity(id).as_ref().map(SenderInfo::from)
    }

    /// Record inbound activity for the liveness sweep.
    pub fn touch(&self, id: ClientId) {
        self.touch_at(id, Instant::now());
    }

    pub fn touch_at(&self, id: ClientId, now: Instant) {
        self.registry().touch(id, now);
    }

    /// Forget a socket after it closed or errored. If it had an identity, the
    /// remaining sockets are told the user logged out.
    pub fn disconnect(&self, id: ClientId) -> Option<ClientConnection> {
        let (conn, total) = {
            let mut reg = self.registry();
            let conn = reg.remove(id);
            (conn, reg.len())
        };
        let conn = conn?;
        conn.handle.terminate();
        match &conn.identity {
            Some(identity) => {
                info!(client_id = %id, user = %identity.username, connections = total, "Client disconnected");
                self.announce_logout(identity);
            }
            None => info!(client_id = %id, connections = total, "Client disconnected"),
        }
        Some(conn)
    }

    pub(crate) fn announce_logout(&self, identity: &Identity) {
        self.broadcast_event(Event::UserLoggedOut(Presence::from(identity)), None, Audience::All);
    }

    /// Deliver one envelope to a single socket.
    pub fn send_to(&self, id: ClientId, envelope: &Envelope) -> Result<(), TrackerError> {
        let text: Arc<str> = envelope.to_text()?.into();
        let handle = self
            .registry()
            .get(id)
            .map(|conn| conn.handle.clone())
            .ok_or(TrackerError::ClientNotFound { id })?;
        handle
            .try_send(Outbound::Text(text))
            .map_err(|message| TrackerError::TransientIo { client: id, message })
    }

    /// Fan an envelope out to every open socket in `audience`.
    ///
    /// The envelope is encoded once; all recipients receive identical text.
    /// Per-socket failures are logged and reported, never propagated.
    pub fn broadcast(&self, envelope: &Envelope, audience: Audience) -> DeliveryReport {
        let text: Arc<str> = match envelope.to_text() {
            Ok(text) => text.into(),
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
                return DeliveryReport::default();
            }
        };

        let recipients = self.registry().recipients(&audience);
        let mut report = DeliveryReport::default();
        for (id, handle) in recipients {
            match handle.try_send(Outbound::Text(Arc::clone(&text))) {
                Ok(()) => report.delivered.push(id),
                Err(message) => {
                    let err = TrackerError::TransientIo { client: id, message };
                    warn!(kind = %envelope.kind, error = %err, "Dropped frame");
                    report.failed.push(id);
                }
            }
        }
        debug!(
            kind = %envelope.kind,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast"
        );
        report
    }

    /// Build the envelope for a typed event and broadcast it.
    pub fn broadcast_event(
        &self,
        event: Event,
        sender: Option<SenderInfo>,
        audience: Audience,
    ) -> DeliveryReport {
        let kind = event.kind();
        match event.into_envelope(sender) {
            Ok(envelope) => self.broadcast(&envelope, audience),
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to build envelope");
                DeliveryReport::default()
            }
        }
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.registry().snapshot(Instant::now())
    }

    pub fn connection_count(&self) -> usize {
        self.registry().len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// In-memory stand-in for a socket: the hub writes into the handle, the
    /// test reads what the writer task would have put on the wire.
    pub struct MockSocket {
        pub id: ClientId,
        pub rx: mpsc::Receiver<Outbound>,
        pub handle: ClientHandle,
    }

    impl MockSocket {
        pub fn connect(hub: &Hub) -> Self {
            Self::connect_with_buffer(hub, 16)
        }

        pub fn connect_with_buffer(hub: &Hub, buffer: usize) -> Self {
            let (handle, rx) = ClientHandle::channel(buffer);
            let id = hub.register(handle.clone());
            Self { id, rx, handle }
        }

        /// Every text frame queued so far.
        pub fn drain_text(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Outbound::Text(text) = frame {
                    out.push(text.to_string());
                }
            }
            out
        }

        pub fn drain_json(&mut self) -> Vec<serde_json::Value> {
            self.drain_text()
                .iter()
                .map(|t| serde_json::from_str(t).unwrap())
                .collect()
        }

        pub fn drain_types(&mut self) -> Vec<String> {
            self.drain_json()
                .into_iter()
                .map(|v| v["type"].as_str().unwrap().to_string())
                .collect()
        }
    }

    pub fn identity(user_id: i64, username: &str, role: Option<&str>) -> Identity {
        Identity {
            user_id,
            username: username.to_string(),
            role: role.map(str::to_string),
        }
    }
}
