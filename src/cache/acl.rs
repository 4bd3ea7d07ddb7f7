//! Cache of effective ACLs, with interned storage.
//!
//! Many inodes share the same few ACLs, so the cache never stores an ACL
//! twice: [`AclStorage`] keeps one refcounted record per distinct ACL and
//! every cache slot holds a handle into it. A chmod recomputes the masks of
//! the affected ACL and swaps the handle atomically.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::master::messages::Acl;
use crate::protocol::{AclType, Inode};

/// Deduplicating refcounted ACL store.
#[derive(Default)]
pub struct AclStorage {
    records: HashMap<Arc<Acl>, usize>,
}

impl AclStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an ACL, bumping the refcount of an identical record if one
    /// exists.
    pub fn acquire(&mut self, acl: Acl) -> Arc<Acl> {
        if let Some((record, _)) = self.records.get_key_value(&acl) {
            let record = Arc::clone(record);
            *self.records.get_mut(&acl).expect("record present") += 1;
            return record;
        }
        let record = Arc::new(acl);
        self.records.insert(Arc::clone(&record), 1);
        record
    }

    /// Drop one reference; the record disappears at zero.
    pub fn release(&mut self, record: &Arc<Acl>) {
        let count = match self.records.get_mut(record.as_ref()) {
            Some(count) => count,
            None => return,
        };
        *count -= 1;
        if *count == 0 {
            self.records.remove(record.as_ref());
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn refcount(&self, acl: &Acl) -> usize {
        self.records.get(acl).copied().unwrap_or(0)
    }
}

type CacheKey = (Inode, u32, u32, AclType);

struct Inner {
    entries: LruCache<CacheKey, Option<Arc<Acl>>>,
    storage: AclStorage,
}

/// `(inode, uid, gid, kind)` -> effective ACL. A cached `None` means the
/// master answered "no ACL" and saves the round trip too.
pub struct AclCache {
    inner: Mutex<Inner>,
}

impl AclCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero");
        Self {
            inner: Mutex::new(Inner { entries: LruCache::new(capacity), storage: AclStorage::new() }),
        }
    }

    pub fn get(&self, inode: Inode, uid: u32, gid: u32, acl_type: AclType) -> Option<Option<Arc<Acl>>> {
        self.inner.lock().entries.get(&(inode, uid, gid, acl_type)).cloned()
    }

    pub fn insert(
        &self,
        inode: Inode,
        uid: u32,
        gid: u32,
        acl_type: AclType,
        acl: Option<Acl>,
    ) {
        let mut inner = self.inner.lock();
        let record = acl.map(|acl| inner.storage.acquire(acl));
        if let Some(previous) = inner.entries.push((inode, uid, gid, acl_type), record) {
            // either the replaced slot or an evicted LRU victim
            if let Some(record) = previous.1 {
                inner.storage.release(&record);
            }
        }
    }

    /// Drop every cached answer for an inode.
    pub fn erase_inode(&self, inode: Inode) {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.0 == inode)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(Some(record)) = inner.entries.pop(&key) {
                inner.storage.release(&record);
            }
        }
    }

    /// A chmod changed the inode's mode bits: recompute the masks of any
    /// cached ACL and replace the records atomically.
    pub fn set_mode(&self, inode: Inode, mode: u16, is_dir: bool) {
        let mut inner = self.inner.lock();
        let affected: Vec<(CacheKey, Arc<Acl>)> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.0 == inode)
            .filter_map(|(key, value)| value.as_ref().map(|record| (*key, Arc::clone(record))))
            .collect();
        for (key, old_record) in affected {
            let updated = with_mode(&old_record, mode, is_dir);
            if updated == *old_record.as_ref() {
                continue;
            }
            let new_record = inner.storage.acquire(updated);
            inner.entries.put(key, Some(Arc::clone(&new_record)));
            inner.storage.release(&old_record);
        }
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().storage.record_count()
    }
}

/// Masks derived from mode bits (rwx triplets). Directory default flags
/// are preserved.
fn with_mode(acl: &Acl, mode: u16, _is_dir: bool) -> Acl {
    let mut updated = acl.clone();
    updated.owner_mask = (mode >> 6) & 0o7;
    updated.group_mask = (mode >> 3) & 0o7;
    updated.other_mask = mode & 0o7;
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_acl(owner_mask: u16) -> Acl {
        Acl { owner_mask, group_mask: 5, other_mask: 0, flags: 0, entries: vec![] }
    }

    #[test]
    fn storage_deduplicates() {
        let mut storage = AclStorage::new();
        let a = storage.acquire(sample_acl(7));
        let b = storage.acquire(sample_acl(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(storage.record_count(), 1);
        assert_eq!(storage.refcount(&sample_acl(7)), 2);

        storage.release(&a);
        assert_eq!(storage.record_count(), 1);
        assert_eq!(storage.refcount(&sample_acl(7)), 1);
        storage.release(&b);
        assert_eq!(storage.record_count(), 0);
    }

    #[test]
    fn n_sets_one_record() {
        // N identical inserts and N-1 erases leave one record, refcount 1
        let cache = AclCache::new(100);
        for inode in 1..=5u32 {
            cache.insert(inode, 0, 0, AclType::Access, Some(sample_acl(6)));
        }
        assert_eq!(cache.record_count(), 1);
        for inode in 1..=4u32 {
            cache.erase_inode(inode);
        }
        assert_eq!(cache.record_count(), 1);
        let inner = cache.inner.lock();
        assert_eq!(inner.storage.refcount(&sample_acl(6)), 1);
    }

    #[test]
    fn negative_answers_are_cached() {
        let cache = AclCache::new(10);
        assert_eq!(cache.get(1, 0, 0, AclType::Access), None);
        cache.insert(1, 0, 0, AclType::Access, None);
        assert_eq!(cache.get(1, 0, 0, AclType::Access), Some(None));
    }

    #[test]
    fn chmod_recomputes_masks_and_reintern() {
        let cache = AclCache::new(10);
        cache.insert(1, 0, 0, AclType::Access, Some(sample_acl(7)));
        cache.insert(2, 0, 0, AclType::Access, Some(sample_acl(7)));
        cache.set_mode(1, 0o640, false);

        let updated = cache.get(1, 0, 0, AclType::Access).unwrap().unwrap();
        assert_eq!(updated.owner_mask, 6);
        assert_eq!(updated.group_mask, 4);
        assert_eq!(updated.other_mask, 0);

        // inode 2 still holds the old record; storage has both now
        let untouched = cache.get(2, 0, 0, AclType::Access).unwrap().unwrap();
        assert_eq!(untouched.owner_mask, 7);
        assert_eq!(cache.record_count(), 2);
    }

    #[test]
    fn eviction_releases_records() {
        let cache = AclCache::new(2);
        cache.insert(1, 0, 0, AclType::Access, Some(sample_acl(1)));
        cache.insert(2, 0, 0, AclType::Access, Some(sample_acl(2)));
        cache.insert(3, 0, 0, AclType::Access, Some(sample_acl(3)));
        // the first record was evicted and its storage reclaimed
        assert_eq!(cache.record_count(), 2);
        assert_eq!(cache.get(1, 0, 0, AclType::Access), None);
    }
}
