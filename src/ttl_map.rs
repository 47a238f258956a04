//! A hash map whose entries expire after a fixed time-to-live.
//!
//! Both shared replay tables (the incomplete reply pairs and the cursor
//! translations) need bounded memory under unmatched traffic, so they share
//! this one structure: a map paired with a min-heap of expiry deadlines.
//! Writes sweep the heap, and reads evict the entry they hit if it has
//! lapsed, so no background task is needed.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    hash::Hash,
    time::Duration,
};

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub(crate) struct TtlMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
    deadlines: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K, V> TtlMap<K, V>
where
    K: Clone + Eq + Hash + Ord,
{
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Inserts `value`, replacing any previous entry and restarting its TTL.
    /// Lapsed entries anywhere in the map are swept out first.
    pub(crate) fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, key: K, value: V, now: Instant) {
        self.sweep(now);
        let expires_at = now + self.ttl;
        self.deadlines.push(Reverse((expires_at, key.clone())));
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Looks up `key`, evicting it instead if its TTL has lapsed. Reads do
    /// not refresh the TTL.
    pub(crate) fn get_at(&mut self, key: &K, now: Instant) -> Option<&V> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at <= now {
                self.entries.remove(key);
                return None;
            }
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry whose deadline has passed. Heap entries left behind
    /// by overwrites are skipped by checking them against the live deadline.
    fn sweep(&mut self, now: Instant) {
        while let Some(Reverse((deadline, key))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let deadline = *deadline;
            let key = key.clone();
            self.deadlines.pop();

            if let Some(entry) = self.entries.get(&key) {
                if entry.expires_at <= deadline {
                    self.entries.remove(&key);
                }
            }
        }
    }
}
