// Notification fan-out: one bounded queue per subscriber.
//
// Publishing never blocks. A subscriber whose queue is full misses that event
// (logged), and a subscriber whose receiver is gone is dropped from the bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};
use trisync_common::protocol::events::SyncEvent;
use trisync_common::types::ProjectId;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

struct Subscriber {
    project: Option<ProjectId>,
    tx: mpsc::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one project's events, or to every project with `None`.
    pub fn subscribe(&self, project: Option<ProjectId>) -> Subscription {
        self.subscribe_with_capacity(project, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        project: Option<ProjectId>,
        capacity: usize,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, Subscriber { project, tx });

        Subscription { id, rx, bus: Arc::downgrade(&self.inner) }
    }

    pub fn publish(&self, event: SyncEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut closed = Vec::new();

        for (id, subscriber) in &inner.subscribers {
            if subscriber.project.as_ref().is_some_and(|p| p != event.project_id()) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = id,
                        event = event.type_name(),
                        project_id = %event.project_id(),
                        "subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            trace!(subscriber = id, "removing closed subscriber");
            inner.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).subscribers.len()
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<SyncEvent>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.rx.try_recv().ok()
    }

    /// Explicit unsubscribe; equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().unwrap_or_else(PoisonError::into_inner).subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(id: &str) -> ProjectId {
        ProjectId::parse(id).unwrap()
    }

    fn stopped(id: &str) -> SyncEvent {
        SyncEvent::Stopped { project_id: project(id) }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None);

        bus.publish(SyncEvent::Started { project_id: project("a"), interval_ms: 10 });
        bus.publish(stopped("a"));

        assert_eq!(sub.recv().await.unwrap().type_name(), "started");
        assert_eq!(sub.recv().await.unwrap().type_name(), "stopped");
    }

    #[tokio::test]
    async fn project_filter_skips_other_projects() {
        let bus = EventBus::new();
        let mut only_a = bus.subscribe(Some(project("a")));

        bus.publish(stopped("b"));
        bus.publish(stopped("a"));

        assert_eq!(only_a.recv().await.unwrap().project_id(), &project("a"));
        assert!(only_a.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_and_drop_remove_subscriber() {
        let bus = EventBus::new();
        let first = bus.subscribe(None);
        let second = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 2);

        first.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(second);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn full_queue_drops_event_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_with_capacity(None, 1);

        bus.publish(stopped("a"));
        bus.publish(stopped("b"));

        assert_eq!(sub.try_recv().unwrap().project_id(), &project("a"));
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count(), 1);
    }
}
