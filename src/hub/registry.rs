//! Bookkeeping for live sockets: one entry per connection, holding the
//! outbound queue, optional identity and last-activity instant.
//!
//! The registry itself is not synchronized; [`super::Hub`] wraps it in a
//! mutex and never holds that lock across an await or a socket write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use twinfix_common::SenderInfo;
use twinfix_common::envelope::Presence;

use super::Audience;

/// Process-unique connection id, assigned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A frame queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-serialized envelope. Shared so every recipient of a broadcast gets
    /// the same bytes without re-encoding.
    Text(Arc<str>),
    Ping,
}

/// Sending half of a connection: the bounded outbound queue plus the token
/// that tears the socket down.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
}

impl ClientHandle {
    pub fn new(tx: mpsc::Sender<Outbound>, shutdown: CancellationToken) -> Self {
        Self { tx, shutdown }
    }

    /// Build a handle together with the receiver its writer task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// Queue a frame without waiting. A full queue means the client is not
    /// keeping up; the frame is dropped for that client only.
    pub fn try_send(&self, frame: Outbound) -> Result<(), String> {
        if self.shutdown.is_cancelled() {
            return Err("socket is shutting down".to_string());
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => "outbound queue full".to_string(),
            TrySendError::Closed(_) => "socket closed".to_string(),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.shutdown.is_cancelled()
    }

    pub fn terminate(&self) {
        self.shutdown.cancel();
    }
}

/// Who is behind a socket, learned from a `user_logged_in` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub role: Option<String>,
}

impl From<Presence> for Identity {
    fn from(p: Presence) -> Self {
        Self {
            user_id: p.user_id,
            username: p.username,
            role: p.role,
        }
    }
}

impl From<&Identity> for Presence {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id,
            username: identity.username.clone(),
            role: identity.role.clone(),
        }
    }
}

impl From<&Identity> for SenderInfo {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.user_id,
            username: identity.username.clone(),
            role: identity.role.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ClientConnection {
    pub handle: ClientHandle,
    pub identity: Option<Identity>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
}

/// Snapshot row for the admin listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: u64,
}

#[derive(Debug, Default)]
pub struct Registry {
    next_id: u64,
    clients: HashMap<ClientId, ClientConnection>,
}

impl Registry {
    pub fn insert(&mut self, handle: ClientHandle, now: Instant) -> ClientId {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        self.clients.insert(
            id,
            ClientConnection {
                handle,
                identity: None,
                connected_at: Utc::now(),
                last_activity: now,
            },
        );
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&id)
    }

    /// Attach (or replace) the identity of a socket. Returns false when the
    /// socket is unknown.
    pub fn set_identity(&mut self, id: ClientId, identity: Identity) -> bool {
        match self.clients.get_mut(&id) {
            Some(conn) => {
                conn.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, id: ClientId, now: Instant) -> bool {
        match self.clients.get_mut(&id) {
            Some(conn) => {
                conn.last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientConnection> {
        self.clients.remove(&id)
    }

    /// Open sockets selected by `audience`, with handles cloned out so the
    /// caller can send after releasing the lock.
    pub fn recipients(&self, audience: &Audience) -> Vec<(ClientId, ClientHandle)> {
        let mut out: Vec<_> = self
            .clients
            .iter()
            .filter(|(id, conn)| conn.handle.is_open() && audience.includes(**id, conn.identity.as_ref()))
            .map(|(id, conn)| (*id, conn.handle.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Remove every connection whose last activity is older than `timeout`
    /// relative to `now`.
    pub fn take_idle(&mut self, now: Instant, timeout: Duration) -> Vec<(ClientId, ClientConnection)> {
        let stale: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, conn)| now.saturating_duration_since(conn.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.clients.remove(&id).map(|conn| (id, conn)))
            .collect()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<ClientInfo> {
        let mut rows: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|(id, conn)| ClientInfo {
                client_id: *id,
                user_id: conn.identity.as_ref().map(|i| i.user_id),
                username: conn.identity.as_ref().map(|i| i.username.clone()),
                role: conn.identity.as_ref().and_then(|i| i.role.clone()),
                connected_at: conn.connected_at,
                idle_secs: now.saturating_duration_since(conn.last_activity).as_secs(),
            })
            .collect();
        rows.sort_by_key(|row| row.client_id);
        rows
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: i64, role: &str) -> Identity {
        Identity {
            user_id,
            username: format!("user{user_id}"),
            role: Some(role.to_string()),
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut reg = Registry::default();
        let now = Instant::now();
        let (h1, _rx1) = ClientHandle::channel(4);
        let (h2, _rx2) = ClientHandle::channel(4);
        let a = reg.insert(h1, now);
        let b = reg.insert(h2, now);
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn recipients_skip_closed_sockets() {
        let mut reg = Registry::default();
        let now = Instant::now();
        let (open, _rx_open) = ClientHandle::channel(4);
        let (closed, rx_closed) = ClientHandle::channel(4);
        let open_id = reg.insert(open, now);
        reg.insert(closed, now);
        drop(rx_closed);

        let ids: Vec<_> = reg.recipients(&Audience::All).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![open_id]);
    }

    #[test]
    fn recipients_filter_by_role_and_user() {
        let mut reg = Registry::default();
        let now = Instant::now();
        let (h1, _r1) = ClientHandle::channel(4);
        let (h2, _r2) = ClientHandle::channel(4);
        let (h3, _r3) = ClientHandle::channel(4);
        let a = reg.insert(h1, now);
        let b = reg.insert(h2, now);
        let _anon = reg.insert(h3, now);
        reg.set_identity(a, identity(10, "admin"));
        reg.set_identity(b, identity(11, "repairman"));

        let admins = reg.recipients(&Audience::Roles(vec!["admin".to_string()]));
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].0, a);

        let users = reg.recipients(&Audience::Users(vec![11]));
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].0, b);
    }

    #[test]
    fn take_idle_removes_only_stale_connections() {
        let mut reg = Registry::default();
        let start = Instant::now();
        let (h1, _r1) = ClientHandle::channel(4);
        let (h2, _r2) = ClientHandle::channel(4);
        let stale = reg.insert(h1, start);
        let fresh = reg.insert(h2, start);
        reg.touch(fresh, start + Duration::from_secs(3000));

        let evicted = reg.take_idle(start + Duration::from_secs(3700), Duration::from_secs(3600));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, stale);
        assert!(reg.get(stale).is_none());
        assert!(reg.get(fresh).is_some());
    }

    #[test]
    fn terminated_handle_rejects_frames() {
        let (handle, _rx) = ClientHandle::channel(4);
        handle.terminate();
        assert!(!handle.is_open());
        assert!(handle.try_send(Outbound::Ping).is_err());
    }

    #[test]
    fn full_queue_reports_error() {
        let (handle, _rx) = ClientHandle::channel(1);
        handle.try_send(Outbound::Ping).unwrap();
        let err = handle.try_send(Outbound::Ping).unwrap_err();
        assert!(err.contains("full"));
    }
}
