//! I/O bandwidth limiting.
//!
//! Every read and write charges its byte count against a token bucket
//! before any network request is built. Buckets live either in this mount
//! (local limits from a config file) or in the master (fleet-wide limits);
//! the [`limiter::LimiterProxy`] hides the difference and classifies the
//! calling process into its I/O group by cgroup.

pub mod database;
pub mod group;
pub mod limiter;
pub mod token_bucket;

pub use database::IoLimitsDatabase;
pub use limiter::{Limiter, LimiterProxy, MasterLimiter, MountLimiter};
pub use token_bucket::TokenBucket;

/// Group id used when a process cannot be classified. Not a valid cgroup
/// name, so it never collides with a real group.
pub const UNCLASSIFIED: &str = "unclassified";
