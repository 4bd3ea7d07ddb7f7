//! High-level reader for one chunk at a time.
//!
//! Owns the locate -> plan -> execute cycle for the chunk a file descriptor
//! is currently reading, remembers which replicas returned corrupt data so
//! re-plans exclude them, and handles the empty-chunk (all zeros) case
//! without any chunkserver traffic.

use std::sync::Arc;

use log::debug;

use crate::common::chunk_part::ChunkPartType;
use crate::common::chunkserver_stats::ChunkserverStats;
use crate::cs::ConnectionPool;
use crate::error::{FsError, Result};
use crate::protocol::{Inode, NetworkAddress, BLOCK_SIZE, CHUNK_SIZE};

use super::executor::{ReadPlanExecutor, ReadTimeouts};
use super::locator::{ChunkLocation, ChunkLocator};
use super::planner::{PartInstance, ReadPlanner};

pub struct ChunkReader {
    locator: Arc<ChunkLocator>,
    pool: Arc<ConnectionPool>,
    stats: Arc<ChunkserverStats>,
    planner: ReadPlanner,
    inode: Inode,
    chunk_index: u32,
    location: Option<Arc<ChunkLocation>>,
    crc_errors: Vec<(NetworkAddress, ChunkPartType)>,
    chunk_already_read: bool,
}

impl ChunkReader {
    pub fn new(
        locator: Arc<ChunkLocator>,
        pool: Arc<ConnectionPool>,
        stats: Arc<ChunkserverStats>,
        timeouts: &ReadTimeouts,
    ) -> Self {
        Self {
            locator,
            pool,
            stats,
            planner: ReadPlanner::new(timeouts.wave),
            inode: 0,
            chunk_index: 0,
            location: None,
            crc_errors: Vec::new(),
            chunk_already_read: false,
        }
    }

    /// Point the reader at a chunk and resolve its location. Re-preparing
    /// the same chunk is a no-op unless forced (after a write changed the
    /// chunk, or after an error).
    pub async fn prepare(&mut self, inode: Inode, chunk_index: u32, force: bool) -> Result<()> {
        if inode != self.inode || chunk_index != self.chunk_index {
            // moved to a new chunk
            self.crc_errors.clear();
        } else if !force && self.location.is_some() {
            return Ok(());
        }
        self.inode = inode;
        self.chunk_index = chunk_index;
        self.location = Some(self.locator.relocate(inode, chunk_index).await?);
        self.chunk_already_read = false;
        Ok(())
    }

    pub fn file_length(&self) -> u64 {
        self.location.as_ref().map(|location| location.file_length).unwrap_or(0)
    }

    /// Read up to `size` bytes at `offset` (chunk relative) into `buffer`.
    /// Returns how many bytes were appended; fewer than `size` means the
    /// read hit the end of the file.
    pub async fn read(
        &mut self,
        buffer: &mut Vec<u8>,
        offset: u32,
        size: u32,
        timeouts: &ReadTimeouts,
        prefetch_window: u32,
    ) -> Result<u32> {
        if size == 0 {
            return Ok(0);
        }
        if offset.checked_add(size).map_or(true, |end| end > CHUNK_SIZE) {
            return Err(FsError::Einval);
        }
        let location = match &self.location {
            Some(location) => Arc::clone(location),
            None => return Err(FsError::Einval),
        };

        let offset_in_file = self.chunk_index as u64 * CHUNK_SIZE as u64 + offset as u64;
        let available = if offset_in_file >= location.file_length {
            0
        } else {
            std::cmp::min((location.file_length - offset_in_file) as u64, size as u64) as u32
        };
        if available == 0 {
            return Ok(0);
        }

        if location.is_empty_chunk() {
            // just some zeros, no chunkserver involved
            buffer.resize(buffer.len() + available as usize, 0);
            return Ok(available);
        }

        let chunk_length =
            crate::protocol::bytes_in_chunk(location.file_length, self.chunk_index);
        let first_block = offset / BLOCK_SIZE;
        let block_count = (offset + available - first_block * BLOCK_SIZE + BLOCK_SIZE - 1)
            / BLOCK_SIZE;

        // No point prefetching when re-reading a chunk (the page cache has
        // it) or when the request already reaches the end of the data.
        let prefetch = if self.chunk_already_read || size != available {
            0
        } else {
            prefetch_window
        };

        let instances = self.available_instances(&location);
        let plan =
            self.planner.plan(first_block, block_count, chunk_length, &instances, prefetch)?;

        let executor = ReadPlanExecutor::new(
            Arc::clone(&self.stats),
            location.chunk_id,
            location.version,
            plan,
        );
        self.chunk_already_read = true;
        let output = match executor.execute(&self.pool, timeouts, chunk_length).await {
            Ok(output) => output,
            Err(FsError::ChunkCrc { address, part, chunk_id }) => {
                // remember the poisoned replica and force a fresh location
                debug!(
                    "crc error on chunk {:#x} part {} at {}",
                    chunk_id, part, address
                );
                self.crc_errors.push((address, part));
                self.locator.invalidate(self.inode, self.chunk_index);
                self.location = None;
                return Err(FsError::ChunkCrc { address, part, chunk_id });
            }
            Err(err) => return Err(err),
        };

        let skip = (offset - first_block * BLOCK_SIZE) as usize;
        buffer.extend_from_slice(&output[skip..skip + available as usize]);
        Ok(available)
    }

    fn available_instances(&self, location: &ChunkLocation) -> Vec<PartInstance> {
        location
            .locations
            .iter()
            .filter(|location| {
                !self
                    .crc_errors
                    .contains(&(location.address, location.part_type))
            })
            .map(|location| {
                let entry = self.stats.statistics_for(location.address);
                PartInstance {
                    part_type: location.part_type,
                    address: location.address,
                    score: entry.score(),
                    pending_ops: entry.operation_count(),
                }
            })
            .collect()
    }
}
