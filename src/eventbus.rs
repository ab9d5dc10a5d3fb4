//! In-process publish/subscribe bus (kernel's `event_bus.py`).
//!
//! One unbounded async queue per topic, created lazily on first use. Multiple
//! subscribers to the same topic partition the stream rather than each seeing
//! every event — matching an `asyncio.Queue` with several consumers calling
//! `get()` against it, which is what the original did.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

type Topic = Arc<AsyncMutex<mpsc::UnboundedReceiver<Value>>>;

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    senders: HashMap<String, mpsc::UnboundedSender<Value>>,
    receivers: HashMap<String, Topic>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_topic(&self, topic: &str) -> mpsc::UnboundedSender<Value> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if let Some(sender) = inner.senders.get(topic) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.senders.insert(topic.to_string(), tx.clone());
        inner.receivers.insert(topic.to_string(), Arc::new(AsyncMutex::new(rx)));
        tx
    }

    pub fn publish(&self, topic: &str, event: Value) {
        let sender = self.ensure_topic(topic);
        // An unbounded channel only errs once every receiver handle for this
        // topic has been dropped; there's nothing a publisher can do about
        // that, so the event is simply lost.
        let _ = sender.send(event);
    }

    /// A handle subscribers poll with `.recv()`. Cloning an `EventSubscriber`
    /// does not duplicate events - every clone pulls from the same underlying
    /// queue for this topic.
    pub fn subscribe(&self, topic: &str) -> EventSubscriber {
        self.ensure_topic(topic);
        let receiver = self
            .inner
            .lock()
            .expect("event bus lock poisoned")
            .receivers
            .get(topic)
            .cloned()
            .expect("topic just ensured");
        EventSubscriber { receiver }
    }
}

#[derive(Clone)]
pub struct EventSubscriber {
    receiver: Topic,
}

impl EventSubscriber {
    /// Await the next event on this topic. Returns `None` once every sender
    /// for the topic has been dropped (the bus itself has gone away).
    pub async fn recv(&self) -> Option<Value> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_then_subscribe_delivers_event() {
        let bus = EventBus::new();
        let sub = bus.subscribe("system");
        bus.publish("system", json!({"type": "nudge"}));
        let evt = sub.recv().await.unwrap();
        assert_eq!(evt["type"], "nudge");
    }

    #[tokio::test]
    async fn multiple_subscribers_to_one_topic_partition_events() {
        let bus = EventBus::new();
        let sub_a = bus.subscribe("system");
        let sub_b = sub_a.clone();

        bus.publish("system", json!(1));
        bus.publish("system", json!(2));

        let first = sub_a.recv().await.unwrap();
        let second = sub_b.recv().await.unwrap();
        let mut got = vec![first.as_i64().unwrap(), second.as_i64().unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new();
        let sub = bus.subscribe("alpha");
        bus.publish("beta", json!("ignored"));
        bus.publish("alpha", json!("seen"));
        assert_eq!(sub.recv().await.unwrap(), json!("seen"));
    }
}
