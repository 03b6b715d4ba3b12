//! Fan-out of server events to connected SSE subscribers.
//!
//! Each subscriber owns an unbounded channel, so `publish` never waits on a
//! slow reader. Dropping a [`Subscription`] deregisters it.

use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    State,
    Message,
    Clear,
    AppChanged,
    Gate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::State => "state",
            EventKind::Message => "message",
            EventKind::Clear => "clear",
            EventKind::AppChanged => "app-changed",
            EventKind::Gate => "gate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl ServerEvent {
    pub fn new(kind: EventKind, data: impl Serialize) -> Self {
        Self {
            kind,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, mpsc::UnboundedSender<ServerEvent>>>,
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(Vec::new())
    }

    /// Registers a subscriber whose queue already holds `preamble`, so those
    /// events reach it before anything published afterwards.
    pub fn subscribe_with(&self, preamble: Vec<ServerEvent>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in preamble {
            let _ = tx.send(event);
        }
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        info!(event = "subscriber_added", subscriber = id, clients = count);
        Subscription {
            id,
            rx,
            broadcaster: self.clone(),
        }
    }

    /// Delivers to every current subscriber in registration order.
    pub fn publish(&self, kind: EventKind, data: impl Serialize) {
        let event = ServerEvent::new(kind, data);
        let snapshot: Vec<(u64, mpsc::UnboundedSender<ServerEvent>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(event.clone()).is_err() {
                closed.push(id);
            }
        }
        debug!(event = "publish", kind = kind.as_str());

        if !closed.is_empty() {
            let mut subscribers = self.lock();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// No-op for unknown or already removed ids.
    pub fn unsubscribe(&self, id: u64) {
        let removed = {
            let mut subscribers = self.lock();
            subscribers.remove(&id).map(|_| subscribers.len())
        };
        if let Some(count) = removed {
            info!(event = "subscriber_removed", subscriber = id, clients = count);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, mpsc::UnboundedSender<ServerEvent>>> {
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_next(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn drain(subscription: &mut Subscription) -> Vec<ServerEvent> {
        std::iter::from_fn(|| subscription.try_next()).collect()
    }

    #[test]
    fn preamble_precedes_live_events() {
        let broadcaster = Broadcaster::new();
        let mut subscription = broadcaster.subscribe_with(vec![
            ServerEvent::new(EventKind::Connected, json!({"timestamp": 1})),
            ServerEvent::new(EventKind::State, json!({"header": {}})),
        ]);
        broadcaster.publish(EventKind::Clear, json!({}));

        let kinds: Vec<EventKind> = drain(&mut subscription)
            .into_iter()
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Connected, EventKind::State, EventKind::Clear]
        );
    }

    #[test]
    fn every_subscriber_sees_events_in_publish_order() {
        let broadcaster = Broadcaster::new();
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        for n in 0..3 {
            broadcaster.publish(EventKind::Message, json!({"n": n}));
        }

        for subscription in [&mut first, &mut second] {
            let seen: Vec<Value> = drain(subscription)
                .into_iter()
                .map(|event| event.data["n"].clone())
                .collect();
            assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
        }
    }

    #[test]
    fn late_subscribers_miss_earlier_events() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(EventKind::Message, json!({"n": 0}));
        let mut late = broadcaster.subscribe();
        assert!(late.try_next().is_none());
    }

    #[test]
    fn dropping_a_subscription_unsubscribes_and_unsubscribe_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let kept = broadcaster.subscribe();
        let dropped = broadcaster.subscribe();
        let dropped_id = dropped.id();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(dropped);
        assert_eq!(broadcaster.subscriber_count(), 1);
        broadcaster.unsubscribe(dropped_id);
        broadcaster.unsubscribe(9_999);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish(EventKind::State, json!({}));
        drop(kept);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        let broadcaster = Broadcaster::new();
        let mut subscription = broadcaster.subscribe();
        broadcaster.publish(EventKind::AppChanged, json!({"app": {"name": "demo"}}));

        let event = subscription.next().await.expect("event");
        assert_eq!(event.kind.as_str(), "app-changed");
        assert_eq!(event.data["app"]["name"], "demo");
    }
}
