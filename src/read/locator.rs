//! Chunk location cache.
//!
//! Maps `(inode, chunk index)` to the master's answer about where the chunk
//! lives. Entries stay until something invalidates them: a write changing
//! the version, a CRC error, or a stale-looking reply.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::master::messages::{MasterRequest, MasterResponse, PartLocation};
use crate::master::Master;
use crate::protocol::Inode;

/// Where one chunk of a file lives right now.
#[derive(Clone, Debug)]
pub struct ChunkLocation {
    pub chunk_id: u64,
    pub version: u32,
    pub file_length: u64,
    pub locations: Vec<PartLocation>,
}

impl ChunkLocation {
    /// An empty chunk has no locations; reads of it yield zeros up to the
    /// file length.
    pub fn is_empty_chunk(&self) -> bool {
        self.locations.is_empty()
    }
}

pub struct ChunkLocator {
    master: Arc<Master>,
    cache: Mutex<HashMap<(Inode, u32), Arc<ChunkLocation>>>,
}

impl ChunkLocator {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master, cache: Mutex::new(HashMap::new()) }
    }

    /// Resolve a chunk, asking the master only on a cache miss.
    pub async fn locate(&self, inode: Inode, chunk_index: u32) -> Result<Arc<ChunkLocation>> {
        if let Some(location) = self.cache.lock().get(&(inode, chunk_index)) {
            return Ok(Arc::clone(location));
        }
        self.resolve(inode, chunk_index).await
    }

    /// Drop the cache entry and resolve afresh.
    pub async fn relocate(&self, inode: Inode, chunk_index: u32) -> Result<Arc<ChunkLocation>> {
        self.invalidate(inode, chunk_index);
        self.resolve(inode, chunk_index).await
    }

    pub fn invalidate(&self, inode: Inode, chunk_index: u32) {
        self.cache.lock().remove(&(inode, chunk_index));
    }

    /// Drop every cached chunk of an inode (after truncate or version
    /// change).
    pub fn invalidate_inode(&self, inode: Inode) {
        self.cache.lock().retain(|(cached_inode, _), _| *cached_inode != inode);
    }

    async fn resolve(&self, inode: Inode, chunk_index: u32) -> Result<Arc<ChunkLocation>> {
        let response =
            self.master.request(MasterRequest::ReadChunk { inode, chunk_index }).await?;
        let location = match response {
            MasterResponse::ChunkLocation { file_length, chunk_id, version, locations } => {
                Arc::new(ChunkLocation { chunk_id, version, file_length, locations })
            }
            _ => return Err(FsError::Protocol("unexpected chunk location reply".into())),
        };

        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&(inode, chunk_index)) {
            // A stale reply (older version than what we already know) must
            // not replace fresher data.
            if cached.chunk_id == location.chunk_id && cached.version > location.version {
                debug!(
                    "discarding stale location for inode {} chunk {} (version {} < {})",
                    inode, chunk_index, location.version, cached.version
                );
                return Ok(Arc::clone(cached));
            }
        }
        cache.insert((inode, chunk_index), Arc::clone(&location));
        Ok(location)
    }
}
