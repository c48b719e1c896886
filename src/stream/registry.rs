//! Topic-scoped subscriber registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::stream::event::ChangeEvent;

/// Subscriber callback. Identity is the `Arc` allocation: clones of one
/// `Arc` are the same subscriber, separately created closures are not.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Wraps a closure as a [`ChangeCallback`].
pub fn callback<F>(f: F) -> ChangeCallback
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn callback_key(callback: &ChangeCallback) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}

/// Maps each topic to its set of subscribers.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, HashMap<usize, ChangeCallback>>>,
}

impl SubscriptionRegistry {
    /// Returns `false` when the pair was already registered.
    pub(crate) fn insert(&self, topic: String, callback: &ChangeCallback) -> bool {
        let mut topics = self.topics.lock();
        let subscribers = topics.entry(topic).or_default();
        let key = callback_key(callback);
        if subscribers.contains_key(&key) {
            return false;
        }
        subscribers.insert(key, Arc::clone(callback));
        true
    }

    /// Returns `false` when the pair was not registered.
    pub(crate) fn remove(&self, topic: &str, callback: &ChangeCallback) -> bool {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&callback_key(callback)).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Copies the current subscribers of `topic` so delivery can run without
    /// holding the lock.
    pub(crate) fn snapshot(&self, topic: &str) -> Vec<ChangeCallback> {
        self.topics
            .lock()
            .get(topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, HashMap::len)
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.topics.lock().clear();
    }
}
