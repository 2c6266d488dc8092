//! Observer registry
//!
//! Maps topics to their observers (in subscription order, for delivery) and observers to their
//! topics (for removing an observer everywhere at once). An observer is in the reverse map if and
//! only if it's subscribed to at least one topic.

use message::{Handler, ObserverId};

use std::collections::{BTreeSet, HashMap};

pub struct Subscription {
    pub observer: ObserverId,
    pub handler: Handler,
}

#[derive(Default)]
pub struct ObserverRegistry {
    topics: HashMap<String, Vec<Subscription>>,
    observers: HashMap<ObserverId, BTreeSet<String>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `observer` to `topic`. Returns `false` (and keeps the existing handler) if it
    /// already is.
    pub fn subscribe(&mut self, topic: &str, observer: ObserverId, handler: Handler) -> bool {
        let topics = self.observers.entry(observer).or_insert_with(BTreeSet::new);
        if topics.contains(topic) {
            return false;
        }
        topics.insert(topic.to_owned());

        self.topics.entry(topic.to_owned()).or_insert_with(Vec::new).push(Subscription {
            observer: observer,
            handler: handler,
        });
        true
    }

    /// Removes `observer` from every topic. Returns how many subscriptions it had.
    pub fn unsubscribe(&mut self, observer: ObserverId) -> usize {
        let topics = match self.observers.remove(&observer) {
            Some(topics) => topics,
            None => return 0,
        };
        for topic in &topics {
            self.detach(topic, observer);
        }
        topics.len()
    }

    /// Removes `observer` from `topic` only.
    pub fn unsubscribe_topic(&mut self, topic: &str, observer: ObserverId) -> bool {
        let removed = match self.observers.get_mut(&observer) {
            Some(topics) => topics.remove(topic),
            None => false,
        };
        if !removed {
            return false;
        }
        if self.observers.get(&observer).map_or(false, |topics| topics.is_empty()) {
            self.observers.remove(&observer);
        }
        self.detach(topic, observer);
        true
    }

    fn detach(&mut self, topic: &str, observer: ObserverId) {
        let now_empty = match self.topics.get_mut(topic) {
            Some(subs) => {
                subs.retain(|s| s.observer != observer);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove(topic);
        }
    }

    /// Subscriptions to `topic`, in subscription order.
    pub fn subscriptions(&self, topic: &str) -> &[Subscription] {
        self.topics.get(topic).map(|subs| &subs[..]).unwrap_or(&[])
    }

    pub fn observer_count(&self, topic: &str) -> usize {
        self.subscriptions(topic).len()
    }

    /// Topics `observer` is subscribed to, sorted.
    pub fn topics_of(&self, observer: ObserverId) -> Vec<String> {
        self.observers.get(&observer).map_or(Vec::new(), |t| t.iter().cloned().collect())
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.observers.clear();
    }

    /// Checks that both maps describe the same set of subscriptions.
    #[cfg(test)]
    fn consistent(&self) -> bool {
        let forward: usize = self.topics.values().map(|subs| subs.len()).sum();
        let reverse: usize = self.observers.values().map(|topics| topics.len()).sum();
        forward == reverse
            && self.observers.values().all(|topics| !topics.is_empty())
            && self.observers.iter().all(|(id, topics)| {
                topics.iter().all(|t| self.subscriptions(t).iter().any(|s| s.observer == *id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message::Message;
    use std::sync::Arc;

    fn noop() -> Handler {
        Arc::new(|_: &Message| {})
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut reg = ObserverRegistry::new();
        let id = ObserverId::unique();
        assert!(reg.subscribe("a", id, noop()));
        assert!(!reg.subscribe("a", id, noop()));
        assert_eq!(reg.observer_count("a"), 1);
        assert!(reg.consistent());
    }

    #[test]
    fn keeps_subscription_order() {
        let mut reg = ObserverRegistry::new();
        let ids: Vec<_> = (0..4).map(|_| ObserverId::unique()).collect();
        for &id in &ids {
            reg.subscribe("a", id, noop());
        }
        reg.unsubscribe_topic("a", ids[1]);
        let order: Vec<_> = reg.subscriptions("a").iter().map(|s| s.observer).collect();
        assert_eq!(order, vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn unsubscribe_everywhere() {
        let mut reg = ObserverRegistry::new();
        let x = ObserverId::unique();
        let y = ObserverId::unique();
        for topic in &["a", "b", "c"] {
            reg.subscribe(topic, x, noop());
        }
        reg.subscribe("b", y, noop());
        assert_eq!(reg.topics_of(x), vec!["a", "b", "c"]);

        assert_eq!(reg.unsubscribe(x), 3);
        assert!(reg.topics_of(x).is_empty());
        assert_eq!(reg.observer_count("a"), 0);
        assert_eq!(reg.observer_count("b"), 1);
        assert_eq!(reg.unsubscribe(x), 0);
        assert!(reg.consistent());
    }

    #[test]
    fn last_topic_removes_observer() {
        let mut reg = ObserverRegistry::new();
        let x = ObserverId::unique();
        reg.subscribe("a", x, noop());
        reg.subscribe("b", x, noop());
        assert!(reg.unsubscribe_topic("a", x));
        assert!(!reg.unsubscribe_topic("a", x));
        assert!(reg.consistent());
        assert!(reg.unsubscribe_topic("b", x));
        assert!(reg.consistent());
        assert!(reg.topics_of(x).is_empty());
    }
}
