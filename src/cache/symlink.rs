//! Small cache of symlink targets. Targets are immutable in practice, so a
//! long TTL is safe; unlink/setattr on the inode invalidates anyway.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::protocol::Inode;

pub struct SymlinkCache {
    entries: Mutex<LruCache<Inode, (String, Instant)>>,
    ttl: Duration,
}

impl SymlinkCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero");
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    pub fn get(&self, inode: Inode) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(&inode) {
            Some((target, inserted_at)) if inserted_at.elapsed() <= self.ttl => {
                Some(target.clone())
            }
            Some(_) => {
                entries.pop(&inode);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, inode: Inode, target: String) {
        self.entries.lock().put(inode, (target, Instant::now()));
    }

    pub fn invalidate(&self, inode: Inode) {
        self.entries.lock().pop(&inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_miss_and_invalidate() {
        let cache = SymlinkCache::new(16, Duration::from_secs(3600));
        assert_eq!(cache.get(5), None);
        cache.insert(5, "/target".into());
        assert_eq!(cache.get(5), Some("/target".to_string()));
        cache.invalidate(5);
        assert_eq!(cache.get(5), None);
    }

    #[test]
    fn expiry() {
        let cache = SymlinkCache::new(16, Duration::from_millis(0));
        cache.insert(5, "/target".into());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(5), None);
    }
}
