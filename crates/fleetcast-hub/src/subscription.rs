use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::Serialize;

/// Subscriber count for one topic, as reported by [`SubscriptionIndex::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub subscriber_count: usize,
}

#[derive(Default)]
struct Maps {
    /// topic -> subscriber ids
    topics: HashMap<String, HashSet<String>>,
    /// subscriber id -> topics
    clients: HashMap<String, HashSet<String>>,
}

/// Bidirectional topic ↔ subscriber index.
///
/// Both maps change together under one write lock, so a `(topic, id)` pair is
/// visible from either side or from neither. Empty sets are removed eagerly.
/// This index is independent of each connection's own topic set; see
/// [`IndexSync`](crate::IndexSync) for keeping the two aligned.
#[derive(Default)]
pub struct SubscriptionIndex {
    maps: RwLock<Maps>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, client_id: &str, topic: &str) {
        let mut maps = self.maps.write().expect("subscription index poisoned");
        maps.topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string());
        maps.clients
            .entry(client_id.to_string())
            .or_default()
            .insert(topic.to_string());
    }

    pub fn unsubscribe(&self, client_id: &str, topic: &str) {
        let mut maps = self.maps.write().expect("subscription index poisoned");
        remove_pair(&mut maps.topics, topic, client_id);
        remove_pair(&mut maps.clients, client_id, topic);
    }

    /// Drop every subscription held by `client_id`. Called on disconnect.
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut maps = self.maps.write().expect("subscription index poisoned");
        let Some(topics) = maps.clients.remove(client_id) else {
            return;
        };
        for topic in &topics {
            remove_pair(&mut maps.topics, topic, client_id);
        }
    }

    /// Ids subscribed to exactly `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        let maps = self.maps.read().expect("subscription index poisoned");
        maps.topics
            .get(topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Topics `client_id` is subscribed to.
    pub fn topics(&self, client_id: &str) -> Vec<String> {
        let maps = self.maps.read().expect("subscription index poisoned");
        maps.clients
            .get(client_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, client_id: &str, topic: &str) -> bool {
        let maps = self.maps.read().expect("subscription index poisoned");
        maps.topics
            .get(topic)
            .is_some_and(|ids| ids.contains(client_id))
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let maps = self.maps.read().expect("subscription index poisoned");
        maps.topics.get(topic).map_or(0, HashSet::len)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.maps.read().expect("subscription index poisoned").topics.len()
    }

    /// Number of ids holding at least one subscription.
    pub fn client_count(&self) -> usize {
        self.maps.read().expect("subscription index poisoned").clients.len()
    }

    /// Per-topic subscriber counts, sorted by topic.
    pub fn stats(&self) -> Vec<TopicStats> {
        let maps = self.maps.read().expect("subscription index poisoned");
        let mut stats: Vec<TopicStats> = maps
            .topics
            .iter()
            .map(|(topic, ids)| TopicStats {
                topic: topic.clone(),
                subscriber_count: ids.len(),
            })
            .collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }

    /// Ids subscribed to any topic matching `pattern`, each listed once.
    ///
    /// See [`topic_matches`] for the pattern syntax.
    pub fn subscribers_matching(&self, pattern: &str) -> Vec<String> {
        let maps = self.maps.read().expect("subscription index poisoned");
        let mut seen: HashSet<&str> = HashSet::new();
        for (topic, ids) in &maps.topics {
            if topic_matches(pattern, topic) {
                seen.extend(ids.iter().map(String::as_str));
            }
        }
        seen.into_iter().map(str::to_string).collect()
    }
}

/// Remove `value` from the set at `key`, dropping the set once it is empty.
fn remove_pair(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

/// Match a dot-separated `topic` against a `pattern`.
///
/// - `*` matches exactly one segment.
/// - `**` matches zero or more segments, anywhere in the pattern.
/// - Any other segment must be equal.
/// - An empty pattern matches only the empty topic.
///
/// `device.*` matches `device.status` but not `device.drone1.property`;
/// `device.**` matches both, and `**` matches every topic.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() {
        return topic.is_empty();
    }
    if topic.is_empty() {
        // Only a pattern made entirely of `**` can consume nothing.
        return pattern.split('.').all(|seg| seg == "**");
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    match_segments(&pattern, &topic)
}

fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    let Some((&head, rest)) = pattern.split_first() else {
        return topic.is_empty();
    };

    if head == "**" {
        // Try every split point, consuming 0..=len topic segments.
        return (0..=topic.len()).any(|skip| match_segments(rest, &topic[skip..]));
    }

    let Some((&segment, topic_rest)) = topic.split_first() else {
        return false;
    };
    (head == "*" || head == segment) && match_segments(rest, topic_rest)
}
