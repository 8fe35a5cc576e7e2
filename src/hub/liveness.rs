//! Heartbeat: every tick evicts sockets that have been silent for longer
//! than the idle timeout, then pings the survivors.
//!
//! Only inbound application messages count as activity. Protocol-level pongs
//! keep the TCP path warm but do not keep an abandoned tab registered.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ClientId, Hub, Outbound};

impl Hub {
    /// Remove and terminate every socket idle past the timeout as of `now`.
    /// Authenticated users among them are announced as logged out.
    pub fn sweep_idle(&self, now: Instant) -> Vec<ClientId> {
        let evicted = self.registry().take_idle(now, self.settings.idle_timeout);
        let mut ids = Vec::with_capacity(evicted.len());
        for (id, conn) in evicted {
            conn.handle.terminate();
            info!(
                client_id = %id,
                user = conn.identity.as_ref().map(|i| i.username.as_str()).unwrap_or("-"),
                "Evicted idle client"
            );
            if let Some(identity) = &conn.identity {
                self.announce_logout(identity);
            }
            ids.push(id);
        }
        ids
    }

    /// Queue a ping on every open socket. Returns how many were queued.
    pub fn ping_all(&self) -> usize {
        let recipients = self.registry().recipients(&super::Audience::All);
        recipients
            .into_iter()
            .filter(|(_, handle)| handle.try_send(Outbound::Ping).is_ok())
            .count()
    }

    /// One heartbeat tick.
    pub fn heartbeat(&self, now: Instant) {
        let evicted = self.sweep_idle(now);
        let pinged = self.ping_all();
        debug!(evicted = evicted.len(), pinged, "Heartbeat");
    }
}

/// Run the heartbeat until `shutdown` fires.
pub fn spawn_heartbeat(hub: Arc<Hub>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hub.settings().heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => hub.heartbeat(Instant::now()),
            }
        }
        debug!("Heartbeat stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{MockSocket, identity};
    use super::super::{HubSettings, IDLE_TIMEOUT};
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn idle_socket_is_evicted_and_absent_from_next_broadcast() {
        let hub = Hub::default();
        let mut idle = MockSocket::connect(&hub);
        let mut active = MockSocket::connect(&hub);

        let later = Instant::now() + IDLE_TIMEOUT + Duration::from_secs(60);
        hub.touch_at(active.id, later - Duration::from_secs(5));

        let evicted = hub.sweep_idle(later);
        assert_eq!(evicted, vec![idle.id]);
        assert!(!idle.handle.is_open());

        let report = hub.broadcast(
            &twinfix_common::Envelope::notice("after sweep"),
            super::super::Audience::All,
        );
        assert_eq!(report.delivered, vec![active.id]);
        assert!(idle.drain_text().is_empty());
        assert_eq!(active.drain_text().len(), 1);
    }

    #[test]
    fn sweep_within_timeout_keeps_everyone() {
        let hub = Hub::default();
        let _a = MockSocket::connect(&hub);
        let evicted = hub.sweep_idle(Instant::now() + Duration::from_secs(10));
        assert!(evicted.is_empty());
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn evicted_identified_user_is_announced() {
        let hub = Hub::default();
        let idle = MockSocket::connect(&hub);
        let mut watcher = MockSocket::connect(&hub);
        hub.authenticate(idle.id, identity(9, "gone", None)).unwrap();

        let later = Instant::now() + IDLE_TIMEOUT + Duration::from_secs(1);
        hub.touch_at(watcher.id, later);
        hub.sweep_idle(later);

        assert_eq!(watcher.drain_types(), vec!["user_logged_out"]);
    }

    #[test]
    fn ping_all_queues_a_ping_per_socket() {
        let hub = Hub::default();
        let mut a = MockSocket::connect(&hub);
        let mut b = MockSocket::connect(&hub);
        assert_eq!(hub.ping_all(), 2);
        assert_eq!(a.rx.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(b.rx.try_recv().unwrap(), Outbound::Ping);
    }

    #[tokio::test]
    async fn heartbeat_task_stops_on_shutdown() {
        let hub = Arc::new(Hub::new(HubSettings {
            heartbeat_interval: Duration::from_millis(10),
            ..HubSettings::default()
        }));
        let mut sock = MockSocket::connect(&hub);
        let shutdown = CancellationToken::new();
        let task = spawn_heartbeat(Arc::clone(&hub), shutdown.clone());

        let frame = tokio::time::timeout(Duration::from_secs(2), sock.rx.recv())
            .await
            .expect("heartbeat should ping")
            .unwrap();
        assert_eq!(frame, Outbound::Ping);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("heartbeat should stop")
            .unwrap();
    }
}
