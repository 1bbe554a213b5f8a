//! Publish/subscribe by event kind
//!
//! [`EventBus`] fans events out to subscribers over bounded queues. Publishing
//! never blocks: a subscriber whose queue is full misses the event, and a
//! subscriber that was dropped is pruned on the next publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Events routed by an [`EventBus`]
pub trait BusEvent: Clone + Send + 'static {
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

struct Subscriber<E: BusEvent> {
    /// Empty means every kind
    kinds: Vec<E::Kind>,
    tx: mpsc::Sender<E>,
}

impl<E: BusEvent> Subscriber<E> {
    fn wants(&self, kind: E::Kind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Bounded, non-blocking event fan-out
pub struct EventBus<E: BusEvent> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
    capacity: usize,
}

impl<E: BusEvent> EventBus<E> {
    /// Creates a bus whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to the given kinds; an empty slice subscribes to all of them.
    ///
    /// Dropping the returned [`Subscription`] unregisters it.
    pub fn subscribe(&self, kinds: &[E::Kind]) -> Subscription<E> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                kinds: kinds.to_vec(),
                tx,
            });
        Subscription { rx }
    }

    /// Delivers `event` to every interested subscriber without waiting.
    ///
    /// Returns how many subscribers received it.
    pub fn publish(&self, event: E) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut saw_closed = false;

        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for sub in subscribers.iter().filter(|s| s.wants(kind)) {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!(?kind, "subscriber queue full, dropping event");
                    }
                    Err(TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            self.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| !s.tx.is_closed());
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Receiving end of a subscription
pub struct Subscription<E> {
    rx: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    /// Waits for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

/// Fleet-level event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetEventKind {
    Node,
    Pipeline,
    Container,
}

/// A fleet event: what happened, to whom, and when
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    pub kind: FleetEventKind,
    /// Node ID, execution ID or container ID depending on `kind`
    pub subject: String,
    /// Short verb such as `online`, `offline` or a pipeline state
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

impl FleetEvent {
    fn new(kind: FleetEventKind, subject: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            action: action.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn node(node_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(FleetEventKind::Node, node_id, action)
    }

    pub fn pipeline(execution_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(FleetEventKind::Pipeline, execution_id, action)
    }

    pub fn container(container_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(FleetEventKind::Container, container_id, action)
    }
}

impl BusEvent for FleetEvent {
    type Kind = FleetEventKind;

    fn kind(&self) -> FleetEventKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_by_kind() {
        let bus = EventBus::new(10);
        let mut nodes = bus.subscribe(&[FleetEventKind::Node]);
        let mut all = bus.subscribe(&[]);

        bus.publish(FleetEvent::node("node-1", "online"));
        bus.publish(FleetEvent::pipeline("exec-1", "running"));

        assert_eq!(nodes.recv().await.unwrap().subject, "node-1");
        assert!(nodes.try_recv().is_none());

        assert_eq!(all.recv().await.unwrap().kind, FleetEventKind::Node);
        assert_eq!(all.recv().await.unwrap().kind, FleetEventKind::Pipeline);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(&[]);

        for i in 0..5 {
            bus.publish(FleetEvent::node(format!("node-{i}"), "online"));
        }

        assert_eq!(sub.recv().await.unwrap().subject, "node-0");
        assert_eq!(sub.recv().await.unwrap().subject, "node-1");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(&[FleetEventKind::Container]);
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.publish(FleetEvent::container("c1", "started")), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
