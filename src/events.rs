//! In-process pub/sub for envelopes, plus the [`Broadcaster`] that pairs the
//! bus with the socket hub.
//!
//! Handlers run synchronously on the publishing thread. A handler that
//! returns an error or panics is logged and skipped; it never affects the
//! publisher or the other handlers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};
use twinfix_common::{Envelope, Event, MessageType, SenderInfo};

use crate::hub::{Audience, DeliveryReport, Hub};

pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every message type.
    kind: Option<MessageType>,
    handler: Handler,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub handled: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: MessageType, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    fn add(&self, kind: Option<MessageType>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, handler });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Invoke every matching handler in subscription order.
    pub fn publish(&self, envelope: &Envelope) -> PublishReport {
        // Handlers may subscribe or unsubscribe; never call them under the lock.
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == envelope.kind))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut report = PublishReport::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => report.handled += 1,
                Ok(Err(e)) => {
                    warn!(subscription = id.0, kind = %envelope.kind, error = %e, "Event handler failed");
                    report.failed += 1;
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(subscription = id.0, kind = %envelope.kind, reason = %reason, "Event handler panicked");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Debug-level trail of every domain event that passes through the bus.
pub fn install_audit_log(bus: &EventBus) -> SubscriptionId {
    bus.subscribe_all(|envelope| {
        if envelope.kind.is_domain_event() {
            debug!(
                kind = %envelope.kind,
                sender = envelope.sender.as_ref().map(|s| s.username.as_str()).unwrap_or("-"),
                "Domain event"
            );
        }
        Ok(())
    })
}

/// Publishes server-originated events: in-process subscribers first, then
/// every connected socket.
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<Hub>,
    bus: Arc<EventBus>,
}

impl Broadcaster {
    pub fn new(hub: Arc<Hub>, bus: Arc<EventBus>) -> Self {
        Self { hub, bus }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn publish(&self, event: Event, sender: Option<SenderInfo>) -> DeliveryReport {
        let kind = event.kind();
        let envelope = match event.into_envelope(sender) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to build envelope");
                return DeliveryReport::default();
            }
        };
        self.bus.publish(&envelope);
        self.hub.broadcast(&envelope, Audience::All)
    }
}
