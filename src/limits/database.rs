//! The set of token buckets for the locally configured limit groups.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::{FsError, Result};

use super::token_bucket::TokenBucket;

/// Limits as configured, in KiB/s per group.
pub type LimitsMap = BTreeMap<String, u64>;

#[derive(Default)]
pub struct IoLimitsDatabase {
    groups: BTreeMap<String, TokenBucket>,
}

impl IoLimitsDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configured limits. Existing groups keep their
    /// accumulated budgets; vanished groups are dropped, new ones start
    /// empty. `accumulate_ms` says how much burst each group may save up.
    pub fn set_limits(&mut self, now: Instant, limits: &LimitsMap, accumulate_ms: u32) {
        self.groups.retain(|group, _| limits.contains_key(group));
        for (group, limit_kbps) in limits {
            let bucket = self
                .groups
                .entry(group.clone())
                .or_insert_with(|| TokenBucket::new(now));
            let rate = *limit_kbps as f64 * 1024.0;
            bucket.reconfigure(now, rate, rate * accumulate_ms as f64 / 1000.0);
        }
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn groups_and_limits(&self) -> Vec<(String, u64)> {
        self.groups.iter().map(|(group, bucket)| (group.clone(), bucket.rate() as u64)).collect()
    }

    pub fn request(&mut self, now: Instant, group: &str, bytes: u64) -> Result<u64> {
        match self.groups.get_mut(group) {
            Some(bucket) => Ok(bucket.attempt(now, bytes as f64) as u64),
            None => Err(FsError::Enoent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_group_is_rejected() {
        let mut database = IoLimitsDatabase::new();
        let err = database.request(Instant::now(), "nope", 100).unwrap_err();
        assert!(matches!(err, FsError::Enoent));
    }

    #[test]
    fn limits_refill_over_time() {
        let t0 = Instant::now();
        let mut database = IoLimitsDatabase::new();
        let mut limits = LimitsMap::new();
        limits.insert("g".into(), 1); // 1 KiB/s
        database.set_limits(t0, &limits, 1000);

        assert_eq!(database.request(t0, "g", 100).unwrap(), 0);
        let later = t0 + Duration::from_secs(1);
        assert_eq!(database.request(later, "g", 2048).unwrap(), 1024);
    }

    #[test]
    fn vanished_groups_are_dropped() {
        let t0 = Instant::now();
        let mut database = IoLimitsDatabase::new();
        let mut limits = LimitsMap::new();
        limits.insert("a".into(), 1);
        limits.insert("b".into(), 1);
        database.set_limits(t0, &limits, 200);
        assert_eq!(database.groups(), vec!["a".to_string(), "b".to_string()]);

        limits.remove("a");
        database.set_limits(t0, &limits, 200);
        assert_eq!(database.groups(), vec!["b".to_string()]);
        assert!(database.request(t0, "a", 1).is_err());
    }
}
