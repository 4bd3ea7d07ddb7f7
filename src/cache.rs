//! Client-side metadata caches.
//!
//! All of them are bounded, time-expired, and invalidated in a targeted way
//! when a metadata mutation touches their keys. Constructed per mount;
//! nothing here is global state.

pub mod acl;
pub mod dir_entry;
pub mod symlink;

pub use acl::{AclCache, AclStorage};
pub use dir_entry::DirEntryCache;
pub use symlink::SymlinkCache;
