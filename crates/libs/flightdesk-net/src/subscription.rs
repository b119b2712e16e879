use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// Receiving half of a topic subscription.
pub type TopicReceiver = mpsc::UnboundedReceiver<Envelope>;

#[derive(Debug)]
struct Entry {
    tx: mpsc::UnboundedSender<Envelope>,
    /// Server-side filter re-sent after every successful connect.
    remote_filter: Option<Value>,
}

/// Topic to channel map for one connection. At most one subscriber per topic.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `topic`. A second registration of a live topic is ignored and
    /// returns `None`; the first subscriber keeps receiving.
    pub fn subscribe(&mut self, topic: &str) -> Option<TopicReceiver> {
        if self.entries.get(topic).is_some_and(|entry| !entry.tx.is_closed()) {
            log::warn!("subscription: already subscribed topic={topic}");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.insert(topic.to_owned(), Entry { tx, remote_filter: None });
        Some(rx)
    }

    /// Like [`Self::subscribe`], and remembers `filter` for server-side
    /// registration.
    pub fn subscribe_remote(&mut self, topic: &str, filter: Value) -> Option<TopicReceiver> {
        let rx = self.subscribe(topic)?;
        if let Some(entry) = self.entries.get_mut(topic) {
            entry.remote_filter = Some(filter);
        }
        Some(rx)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    /// Delivers `message` to the subscriber of `topic`. Returns `false` for an
    /// unknown topic or a dropped receiver, which also removes the entry.
    pub fn dispatch(&mut self, topic: &str, message: Envelope) -> bool {
        let Some(entry) = self.entries.get(topic) else {
            log::trace!("subscription: no subscriber topic={topic}");
            return false;
        };
        if entry.tx.send(message).is_ok() {
            return true;
        }
        self.entries.remove(topic);
        log::debug!("subscription: pruned closed receiver topic={topic}");
        false
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `subscribe` envelopes for every remote subscription.
    pub fn remote_subscriptions(&self) -> Vec<Envelope> {
        let mut topics: Vec<(&String, &Value)> = self
            .entries
            .iter()
            .filter_map(|(topic, entry)| entry.remote_filter.as_ref().map(|filter| (topic, filter)))
            .collect();
        topics.sort_by(|a, b| a.0.cmp(b.0));
        topics.into_iter().map(|(topic, filter)| Envelope::subscribe(topic, filter)).collect()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SUBSCRIBE;
    use serde_json::json;

    fn message(kind: &str, id: u64) -> Envelope {
        Envelope::new(kind, json!({ "id": id }))
    }

    #[test]
    fn dispatch_routes_by_topic() {
        let mut registry = SubscriptionRegistry::new();
        let mut flights = registry.subscribe("flight.updated").expect("subscribe");
        let mut crew = registry.subscribe("crew.assigned").expect("subscribe");

        assert!(registry.dispatch("flight.updated", message("flight.updated", 1)));
        assert!(registry.dispatch("crew.assigned", message("crew.assigned", 2)));
        assert!(!registry.dispatch("gate.changed", message("gate.changed", 3)));

        assert_eq!(flights.try_recv().expect("flight message").payload, json!({"id": 1}));
        assert_eq!(crew.try_recv().expect("crew message").payload, json!({"id": 2}));
        assert!(flights.try_recv().is_err());
    }

    #[test]
    fn duplicate_subscribe_is_ignored_and_first_wins() {
        let mut registry = SubscriptionRegistry::new();
        let mut first = registry.subscribe("flight.updated").expect("subscribe");
        assert!(registry.subscribe("flight.updated").is_none());

        registry.dispatch("flight.updated", message("flight.updated", 9));
        assert_eq!(first.try_recv().expect("first keeps receiving").payload, json!({"id": 9}));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dropped_receiver_is_pruned_and_topic_can_be_reused() {
        let mut registry = SubscriptionRegistry::new();
        drop(registry.subscribe("flight.updated"));

        assert!(!registry.dispatch("flight.updated", message("flight.updated", 1)));
        assert!(!registry.contains("flight.updated"));
        assert!(registry.subscribe("flight.updated").is_some());
    }

    #[test]
    fn unsubscribe_and_clear_tear_down_entries() {
        let mut registry = SubscriptionRegistry::new();
        let mut rx = registry.subscribe("a").expect("subscribe");
        let _b = registry.subscribe("b").expect("subscribe");

        assert!(registry.unsubscribe("a"));
        assert!(!registry.unsubscribe("a"));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn remote_subscriptions_replay_filters_in_topic_order() {
        let mut registry = SubscriptionRegistry::new();
        let _local = registry.subscribe("local.only").expect("subscribe");
        let _z = registry.subscribe_remote("z.topic", json!({"airline": "SK"})).expect("subscribe");
        let _a = registry.subscribe_remote("a.topic", json!(null)).expect("subscribe");

        let replay = registry.remote_subscriptions();
        assert_eq!(replay.len(), 2);
        assert!(replay.iter().all(|envelope| envelope.kind == SUBSCRIBE));
        assert_eq!(replay[0].payload, json!({"topic": "a.topic", "filter": null}));
        assert_eq!(replay[1].payload, json!({"topic": "z.topic", "filter": {"airline": "SK"}}));
        assert_eq!(registry.topics(), vec!["a.topic", "local.only", "z.topic"]);
    }
}
