//! Directory entry and attribute cache.
//!
//! Caches whole `readdir` batches so that the usual lookup-after-readdir
//! storm never reaches the master. Three ways in: by `(session, parent,
//! entry index)` for readdir continuation, by `(session, parent, name)` for
//! lookups, and by inode for targeted invalidation. A special
//! end-of-directory row (inode 0) remembers where a directory listing
//! ended so readdir past it short-circuits.
//!
//! Batch inserts and invalidations take the write lock; lookups only the
//! read lock. Expired entries are dropped lazily at access time and by
//! `sweep_expired`, which works in bounded batches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::protocol::{Attributes, Inode};

type Key = (u64, Inode, u32);

#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub index: u32,
    pub inode: Inode,
    pub name: String,
    pub attributes: Attributes,
    inserted_at: Instant,
}

impl CachedEntry {
    /// An inode of 0 marks "no more entries from here on".
    pub fn is_end_marker(&self) -> bool {
        self.inode == 0
    }
}

struct Inner {
    by_index: HashMap<Key, CachedEntry>,
    by_name: HashMap<(u64, Inode, String), Key>,
    by_inode: HashMap<Inode, HashSet<Key>>,
    // insertion order, for size eviction and expiry sweeps
    insertion_queue: VecDeque<Key>,
}

pub struct DirEntryCache {
    inner: RwLock<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl DirEntryCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_index: HashMap::new(),
                by_name: HashMap::new(),
                by_inode: HashMap::new(),
                insertion_queue: VecDeque::new(),
            }),
            ttl,
            capacity,
        }
    }

    /// Cache one contiguous batch of directory entries starting at
    /// `first_index`. With `end_of_directory`, a marker row is placed right
    /// after the batch.
    pub fn feed_batch(
        &self,
        session: u64,
        parent: Inode,
        first_index: u32,
        entries: &[(Inode, String, Attributes)],
        end_of_directory: bool,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let mut index = first_index;
        for (inode, name, attributes) in entries {
            inner.insert(
                session,
                parent,
                CachedEntry {
                    index,
                    inode: *inode,
                    name: name.clone(),
                    attributes: *attributes,
                    inserted_at: now,
                },
            );
            index += 1;
        }
        if end_of_directory {
            inner.insert(
                session,
                parent,
                CachedEntry {
                    index,
                    inode: 0,
                    name: String::new(),
                    attributes: [0u8; 35],
                    inserted_at: now,
                },
            );
        }
        inner.evict_to_capacity(self.capacity);
    }

    /// Lookup by name. Expired entries are treated as misses.
    pub fn lookup(
        &self,
        session: u64,
        parent: Inode,
        name: &str,
    ) -> Option<(Inode, Attributes)> {
        let inner = self.inner.read();
        let key = inner.by_name.get(&(session, parent, name.to_string()))?;
        let entry = inner.by_index.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl || entry.is_end_marker() {
            return None;
        }
        Some((entry.inode, entry.attributes))
    }

    /// Consecutive cached entries from `first_index` on, stopping at the
    /// first gap or expired row. The bool says whether the directory end
    /// was reached within the run.
    pub fn read_from(
        &self,
        session: u64,
        parent: Inode,
        first_index: u32,
        max_entries: usize,
    ) -> (Vec<CachedEntry>, bool) {
        let inner = self.inner.read();
        let mut result = Vec::new();
        let mut index = first_index;
        loop {
            let entry = match inner.by_index.get(&(session, parent, index)) {
                Some(entry) if entry.inserted_at.elapsed() <= self.ttl => entry,
                _ => return (result, false),
            };
            if entry.is_end_marker() {
                return (result, true);
            }
            result.push(entry.clone());
            if result.len() >= max_entries {
                return (result, false);
            }
            index += 1;
        }
    }

    /// Drop every cached row of one directory.
    pub fn invalidate_parent(&self, parent: Inode) {
        let mut inner = self.inner.write();
        let keys: Vec<Key> = inner
            .by_index
            .keys()
            .filter(|(_, cached_parent, _)| *cached_parent == parent)
            .copied()
            .collect();
        for key in keys {
            inner.remove(&key);
        }
    }

    /// Drop every row that mentions the inode (as entry or as parent).
    pub fn invalidate_inode(&self, inode: Inode) {
        let mut inner = self.inner.write();
        let mut keys: Vec<Key> = inner
            .by_inode
            .get(&inode)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default();
        keys.extend(
            inner
                .by_index
                .keys()
                .filter(|(_, parent, _)| *parent == inode)
                .copied(),
        );
        for key in keys {
            inner.remove(&key);
        }
    }

    /// Remove up to `batch` expired entries, oldest first. Returns how many
    /// were dropped; callers repeat on their own schedule.
    pub fn sweep_expired(&self, batch: usize) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        while removed < batch {
            let key = match inner.insertion_queue.front() {
                Some(key) => *key,
                None => break,
            };
            let expired = inner
                .by_index
                .get(&key)
                .map_or(true, |entry| entry.inserted_at.elapsed() > self.ttl);
            if !expired {
                break; // queue is insertion ordered; the rest is younger
            }
            inner.remove(&key);
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn insert(&mut self, session: u64, parent: Inode, entry: CachedEntry) {
        let key = (session, parent, entry.index);
        self.remove(&key);
        if !entry.name.is_empty() {
            // the same name may already be cached under another index
            let name_key = (session, parent, entry.name.clone());
            if let Some(old_key) = self.by_name.get(&name_key).copied() {
                if old_key != key {
                    self.remove(&old_key);
                }
            }
            self.by_name.insert(name_key, key);
        }
        self.by_inode.entry(entry.inode).or_insert_with(HashSet::new).insert(key);
        self.by_index.insert(key, entry);
        self.insertion_queue.push_back(key);
    }

    fn remove(&mut self, key: &Key) {
        let entry = match self.by_index.remove(key) {
            Some(entry) => entry,
            None => return,
        };
        let (session, parent, _) = *key;
        if !entry.name.is_empty() {
            if self.by_name.get(&(session, parent, entry.name.clone())) == Some(key) {
                self.by_name.remove(&(session, parent, entry.name));
            }
        }
        if let Some(keys) = self.by_inode.get_mut(&entry.inode) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_inode.remove(&entry.inode);
            }
        }
        // the queue entry is cleaned up lazily by eviction or sweeps
    }

    fn evict_to_capacity(&mut self, capacity: usize) {
        while self.by_index.len() > capacity {
            let key = match self.insertion_queue.pop_front() {
                Some(key) => key,
                None => break,
            };
            self.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: u64 = 1;
    const ATTR: Attributes = [7u8; 35];

    fn cache() -> DirEntryCache {
        DirEntryCache::new(Duration::from_secs(60), 1000)
    }

    fn named(entries: &[(Inode, &str)]) -> Vec<(Inode, String, Attributes)> {
        entries.iter().map(|(inode, name)| (*inode, name.to_string(), ATTR)).collect()
    }

    #[test]
    fn lookup_after_feed() {
        let cache = cache();
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a"), (101, "b")]), false);
        assert_eq!(cache.lookup(SESSION, 10, "a"), Some((100, ATTR)));
        assert_eq!(cache.lookup(SESSION, 10, "b"), Some((101, ATTR)));
        assert_eq!(cache.lookup(SESSION, 10, "c"), None);
        assert_eq!(cache.lookup(SESSION, 11, "a"), None);
    }

    #[test]
    fn readdir_continuation_and_end_marker() {
        let cache = cache();
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a"), (101, "b")]), true);
        let (entries, end) = cache.read_from(SESSION, 10, 0, 100);
        assert_eq!(entries.len(), 2);
        assert!(end);

        // reading past the end short-circuits to "done"
        let (entries, end) = cache.read_from(SESSION, 10, 2, 100);
        assert!(entries.is_empty());
        assert!(end);
    }

    #[test]
    fn gap_stops_continuation() {
        let cache = cache();
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a")]), false);
        cache.feed_batch(SESSION, 10, 5, &named(&[(105, "f")]), false);
        let (entries, end) = cache.read_from(SESSION, 10, 0, 100);
        assert_eq!(entries.len(), 1);
        assert!(!end);
    }

    #[test]
    fn invalidate_parent_clears_batch() {
        let cache = cache();
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a"), (101, "b")]), true);
        cache.feed_batch(SESSION, 11, 0, &named(&[(200, "x")]), false);
        cache.invalidate_parent(10);
        assert_eq!(cache.lookup(SESSION, 10, "a"), None);
        assert_eq!(cache.lookup(SESSION, 11, "x"), Some((200, ATTR)));
    }

    #[test]
    fn invalidate_inode_clears_all_mentions() {
        let cache = cache();
        // inode 100 linked in two directories
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a")]), false);
        cache.feed_batch(SESSION, 11, 0, &named(&[(100, "hardlink")]), false);
        cache.invalidate_inode(100);
        assert_eq!(cache.lookup(SESSION, 10, "a"), None);
        assert_eq!(cache.lookup(SESSION, 11, "hardlink"), None);
    }

    #[test]
    fn invalidating_a_directory_inode_clears_its_children() {
        let cache = cache();
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a")]), false);
        cache.invalidate_inode(10);
        assert_eq!(cache.lookup(SESSION, 10, "a"), None);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = DirEntryCache::new(Duration::from_millis(0), 1000);
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a")]), false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.lookup(SESSION, 10, "a"), None);
    }

    #[test]
    fn sweep_removes_in_bounded_batches() {
        let cache = DirEntryCache::new(Duration::from_millis(0), 1000);
        let batch: Vec<(Inode, String, Attributes)> =
            (0..10).map(|i| (100 + i, format!("f{}", i), ATTR)).collect();
        cache.feed_batch(SESSION, 10, 0, &batch, false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep_expired(4), 4);
        assert_eq!(cache.sweep_expired(100), 6);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = DirEntryCache::new(Duration::from_secs(60), 3);
        cache.feed_batch(SESSION, 10, 0, &named(&[(100, "a"), (101, "b")]), false);
        cache.feed_batch(SESSION, 10, 2, &named(&[(102, "c"), (103, "d")]), false);
        assert!(cache.len() <= 3);
        assert_eq!(cache.lookup(SESSION, 10, "a"), None);
        assert_eq!(cache.lookup(SESSION, 10, "d"), Some((103, ATTR)));
    }
}
