//! Byte-budgeted LRU map with expiry, tag and segment indexes.
//
// Not synchronized; the cache facade owns it behind a mutex and never holds
// that mutex across an await.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Instant;

use super::index::{SegmentIndex, TagIndex};
use super::lru::LruList;

#[derive(Debug)]
struct Entry<V> {
    value: Arc<V>,
    expires_at: Instant,
    size: usize,
    tags: Vec<String>,
    slot: usize,
}

/// Outcome of [`Store::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Stored after evicting `evicted` older entries.
    Stored { evicted: usize },
    /// Larger than the per-entry limit; nothing changed.
    Rejected,
}

/// Outcome of [`Store::get`].
#[derive(Debug)]
pub enum Lookup<V> {
    Hit(Arc<V>),
    /// Was present but past expiry; deleted by this read.
    Expired,
    Miss,
}

#[derive(Debug)]
pub struct Store<V> {
    items: HashMap<String, Entry<V>>,
    lru: LruList,
    tags: TagIndex,
    segments: SegmentIndex,
    expiry: BTreeSet<(Instant, String)>,
    mem: usize,
    budget: usize,
    max_entry: usize,
}

impl<V> Store<V> {
    pub fn new(budget: usize, max_entry: usize) -> Self {
        Self {
            items: HashMap::new(),
            lru: LruList::new(),
            tags: TagIndex::default(),
            segments: SegmentIndex::default(),
            expiry: BTreeSet::new(),
            mem: 0,
            budget,
            max_entry: max_entry.min(budget),
        }
    }

    /// Inserts or overwrites `key`, evicting from the LRU tail until it fits.
    pub fn insert(
        &mut self,
        key: String,
        value: Arc<V>,
        size: usize,
        expires_at: Instant,
        tags: Vec<String>,
    ) -> Insert {
        if size > self.max_entry {
            return Insert::Rejected;
        }

        self.remove(&key);
        let evicted = self.evict_to(self.budget - size);

        for tag in &tags {
            self.tags.add(tag, &key);
        }
        self.segments.insert(&key);
        self.expiry.insert((expires_at, key.clone()));
        let slot = self.lru.push_front(key.clone());
        self.mem += size;
        self.items.insert(
            key,
            Entry {
                value,
                expires_at,
                size,
                tags,
                slot,
            },
        );

        Insert::Stored { evicted }
    }

    /// Returns a live entry and marks it most recently used.
    pub fn get(&mut self, key: &str, now: Instant) -> Lookup<V> {
        let (slot, expired) = match self.items.get(key) {
            Some(e) => (e.slot, e.expires_at <= now),
            None => return Lookup::Miss,
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }
        self.lru.touch(slot);
        match self.items.get(key) {
            Some(e) => Lookup::Hit(Arc::clone(&e.value)),
            None => Lookup::Miss,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Drops `key` from the map and every index.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.items.remove(key) else {
            return false;
        };
        self.lru.remove(entry.slot);
        self.tags.remove_key(key, &entry.tags);
        self.segments.remove(key);
        self.expiry.remove(&(entry.expires_at, key.to_string()));
        self.mem -= entry.size;
        true
    }

    /// Removes every key starting with `prefix`; returns how many went.
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let keys = self.segments.with_prefix(prefix);
        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Removes every key ending with `suffix`; returns how many went.
    pub fn remove_suffix(&mut self, suffix: &str) -> usize {
        let keys = self.segments.with_suffix(suffix);
        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Removes every key under `tag` and the tag itself.
    pub fn remove_tag(&mut self, tag: &str) -> usize {
        let keys = self.tags.take(tag);
        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Deletes up to `max` expired entries, oldest expiry first.
    pub fn sweep_expired(&mut self, now: Instant, max: usize) -> usize {
        let due: Vec<String> = self
            .expiry
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(max)
            .map(|(_, key)| key.clone())
            .collect();
        due.iter().filter(|k| self.remove(k)).count()
    }

    /// Evicts least recently used entries until usage is at most `target` bytes.
    pub fn evict_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.mem > target {
            let Some(key) = self.lru.peek_tail().map(str::to_string) else {
                break;
            };
            self.remove(&key);
            evicted += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.lru.clear();
        self.tags.clear();
        self.segments.clear();
        self.expiry.clear();
        self.mem = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Estimated bytes in use.
    pub fn mem(&self) -> usize {
        self.mem
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn tag_members(&self, tag: &str) -> usize {
        self.tags.members(tag)
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}
