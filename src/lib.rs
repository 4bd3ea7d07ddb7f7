//! This crate implements the mount-side chunk I/O engine of ReefFS.
//!
//! # Data placement
//!
//! Files are split into fixed-size chunks (64 MiB), each addressed by a
//! `chunk_id`/`version` pair. A chunk is stored either as full standard
//! copies, or split into XOR or Reed-Solomon parts spread over several
//! chunkservers. The master server keeps the metadata and hands out chunk
//! locations; chunkservers store the actual block data.
//!
//! # Read path
//!
//! [`read::ChunkLocator`] resolves `(inode, chunk index)` to a location set,
//! [`read::ReadPlanner`] picks the cheapest set of parts to ask (with timed
//! fallback waves), and [`read::ReadPlanExecutor`] runs the plan over pooled
//! chunkserver connections, validating per-block CRCs and reconstructing
//! missing stripes through the erasure [`ec::Codec`]. The
//! [`read::ReadaheadAdviser`] watches access patterns and widens requests
//! for sequential readers.
//!
//! # Write path
//!
//! [`write::ChunkWriter`] pins a chunk with a master-issued lock id,
//! streams blocks to the head of the chunkserver chain, and releases the
//! lock on flush. Reads on a handle with pending writes drain them first, so
//! a handle always observes its own writes.
//!
//! # Throttling
//!
//! [`limits::LimiterProxy`] classifies callers into I/O groups (by cgroup)
//! and charges a token bucket before any network request is built; buckets
//! are refilled locally or by the master, depending on configuration.

pub mod cache;
pub mod client;
pub mod common;
pub mod config;
pub mod cs;
pub mod ec;
pub mod error;
pub mod limits;
pub mod locks;
pub mod master;
pub mod protocol;
pub mod read;
pub mod write;
