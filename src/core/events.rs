//! Change notifications keyed by topic.
//!
//! Observers register per topic and get back a [`Subscription`]; dropping it
//! unregisters the callback, so tearing down a view is deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::core::controller::{InputEstimate, ValidationError};
use crate::core::message::{MessageId, MessageStatus, TopicId};
use crate::core::store::Commit;

#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    MessageAppended {
        message_id: MessageId,
    },
    MessageUpdated {
        message_id: MessageId,
        status: MessageStatus,
    },
    ChunkAppended {
        message_id: MessageId,
        delta: String,
    },
    MessagesReplaced,
    SessionStarted {
        message_id: MessageId,
    },
    SessionFinished {
        message_id: MessageId,
        status: MessageStatus,
    },
    Rejected(ValidationError),
    PersistenceDegraded {
        reason: String,
    },
    TokenEstimate(InputEstimate),
}

/// Fire-and-forget delivery of topic events.
pub trait NotificationBus: Send + Sync {
    fn publish(&self, topic_id: &str, event: TopicEvent);
}

/// Surface a non-durable commit to observers.
pub(crate) fn publish_commit(bus: &dyn NotificationBus, topic_id: &str, commit: &Commit) {
    if let Commit::InMemoryOnly { reason } = commit {
        bus.publish(
            topic_id,
            TopicEvent::PersistenceDegraded {
                reason: reason.clone(),
            },
        );
    }
}

type Callback = Arc<dyn Fn(&TopicEvent) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<TopicId, Vec<(u64, Callback)>>>,
}

impl HubInner {
    fn unsubscribe(&self, topic_id: &str, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(topic_id) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                subscribers.remove(topic_id);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic_id: &str, callback: F) -> Subscription
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            hub: Arc::downgrade(&self.inner),
            topic_id: topic_id.to_string(),
            id,
        }
    }

    /// Subscribe with a channel instead of a callback, for async consumers.
    pub fn subscribe_channel(
        &self,
        topic_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<TopicEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(topic_id, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    pub fn subscriber_count(&self, topic_id: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic_id)
            .map_or(0, Vec::len)
    }
}

impl NotificationBus for NotificationHub {
    fn publish(&self, topic_id: &str, event: TopicEvent) {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match subscribers.get(topic_id) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(&event);
        }
    }
}

/// Registration handle; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<HubInner>,
    topic_id: TopicId,
    id: u64,
}

impl Subscription {
    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.topic_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn events_reach_only_their_topic() {
        let hub = NotificationHub::new();
        let (_a, mut rx_a) = hub.subscribe_channel("a");
        let (_b, mut rx_b) = hub.subscribe_channel("b");

        hub.publish("a", TopicEvent::MessagesReplaced);

        assert_eq!(rx_a.try_recv().expect("event"), TopicEvent::MessagesReplaced);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let hub = NotificationHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let subscription = hub.subscribe("t", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish("t", TopicEvent::MessagesReplaced);
        assert_eq!(hub.subscriber_count("t"), 1);
        drop(subscription);
        hub.publish("t", TopicEvent::MessagesReplaced);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count("t"), 0);
    }

    #[test]
    fn callbacks_may_subscribe_while_publishing() {
        let hub = NotificationHub::new();
        let inner_hub = hub.clone();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let keep = Arc::clone(&nested);
        let _outer = hub.subscribe("t", move |_| {
            let subscription = inner_hub.subscribe("t", |_| {});
            keep.lock().expect("lock").push(subscription);
        });

        hub.publish("t", TopicEvent::MessagesReplaced);

        assert_eq!(hub.subscriber_count("t"), 2);
    }

    #[test]
    fn in_memory_commit_is_published_as_degraded() {
        let hub = NotificationHub::new();
        let (_sub, mut rx) = hub.subscribe_channel("t");

        publish_commit(&hub, "t", &Commit::Durable);
        publish_commit(
            &hub,
            "t",
            &Commit::InMemoryOnly {
                reason: "disk full".into(),
            },
        );

        assert_eq!(
            rx.try_recv().expect("event"),
            TopicEvent::PersistenceDegraded {
                reason: "disk full".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
