//! The write path.
//!
//! Writing a chunk is a small ceremony: pin the chunk with a lock id from
//! the master (`WRITE_CHUNK`), open a pipeline to the head of the
//! chunkserver chain (`WRITE_INIT`), stream block-aligned `WRITE_DATA`
//! messages with monotonically increasing write ids, collect the (possibly
//! out of order) acks, and on flush close the pipeline and release the
//! lock (`WRITE_CHUNK_END`) with the new file length. The master may
//! reject our lock id after a failover; the ticket is then refreshed and
//! the release retried exactly once.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};

use crate::common::chunkserver_stats::ChunkserverStats;
use crate::cs::{ChunkserverClient, ConnectionPool, CsChannel};
use crate::error::{FsError, Result};
use crate::master::messages::{MasterRequest, MasterResponse, PartLocation};
use crate::master::Master;
use crate::protocol::{Attributes, Inode, NetworkAddress, Status, BLOCK_SIZE, CHUNK_SIZE};
use crate::read::ChunkLocator;

#[derive(Clone, Copy, Debug)]
pub struct WriteConfig {
    /// How many unacknowledged blocks may be in flight per chunk.
    pub window_size: usize,
    /// Retries for lock acquisition and chain setup.
    pub io_retries: u32,
    pub connect_timeout: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            window_size: 32,
            io_retries: 10,
            connect_timeout: Duration::from_millis(1000),
        }
    }
}

/// The master's permission to write one chunk.
#[derive(Clone, Debug)]
pub struct WriteTicket {
    pub chunk_id: u64,
    pub version: u32,
    pub lock_id: u32,
    pub file_length: u64,
    pub chain: Vec<PartLocation>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteState {
    Idle,
    AcquireLock,
    Streaming,
    Flushing,
    ReleaseLock,
    Failing,
}

/// Streams data into a single chunk.
pub struct ChunkWriter {
    master: Arc<Master>,
    pool: Arc<ConnectionPool>,
    stats: Arc<ChunkserverStats>,
    locator: Arc<ChunkLocator>,
    config: WriteConfig,
    inode: Inode,
    chunk_index: u32,
    state: WriteState,
    ticket: Option<WriteTicket>,
    channel: Option<Box<dyn CsChannel>>,
    head: Option<NetworkAddress>,
    next_write_id: u32,
    unacked: BTreeSet<u32>,
    /// Highest byte of the file this pipeline has written so far.
    end_of_data: u64,
}

impl ChunkWriter {
    pub fn new(
        master: Arc<Master>,
        pool: Arc<ConnectionPool>,
        stats: Arc<ChunkserverStats>,
        locator: Arc<ChunkLocator>,
        config: WriteConfig,
        inode: Inode,
        chunk_index: u32,
    ) -> Self {
        Self {
            master,
            pool,
            stats,
            locator,
            config,
            inode,
            chunk_index,
            state: WriteState::Idle,
            ticket: None,
            channel: None,
            head: None,
            next_write_id: 1,
            unacked: BTreeSet::new(),
            end_of_data: 0,
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    pub fn is_dirty(&self) -> bool {
        !matches!(self.state, WriteState::Idle)
    }

    /// Write `data` at `offset` (chunk relative). Pins the chunk and opens
    /// the pipeline on first use. A write landing past the current end of
    /// the chunk's data first zero-fills the hole: the chunkserver must
    /// never be left guessing about untouched bytes of a block.
    pub async fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset as u64 + data.len() as u64 > CHUNK_SIZE as u64 {
            return Err(FsError::Einval);
        }
        if self.state == WriteState::Failing {
            return Err(FsError::Io("write pipeline already failed".into()));
        }
        self.ensure_streaming().await?;

        let chunk_id = self.ticket.as_ref().ok_or(FsError::LockId)?.chunk_id;
        let chunk_start = self.chunk_index as u64 * CHUNK_SIZE as u64;

        let data_end = std::cmp::min(
            self.end_of_data.saturating_sub(chunk_start),
            CHUNK_SIZE as u64,
        ) as u32;
        if offset > data_end {
            self.fill_hole(chunk_id, data_end, offset).await?;
        }

        self.stream_pieces(chunk_id, offset, data).await?;

        self.end_of_data =
            std::cmp::max(self.end_of_data, chunk_start + offset as u64 + data.len() as u64);
        Ok(())
    }

    /// Send explicit zeros for the byte range `[from, to)` of the chunk.
    async fn fill_hole(&mut self, chunk_id: u64, mut from: u32, to: u32) -> Result<()> {
        debug!(
            "zero filling chunk {:#x} bytes [{}, {}) before a sparse write",
            chunk_id, from, to
        );
        while from < to {
            let offset_in_block = from % BLOCK_SIZE;
            let piece = std::cmp::min(to - from, BLOCK_SIZE - offset_in_block);
            let zeros = vec![0u8; piece as usize];
            self.stream_pieces(chunk_id, from, &zeros).await?;
            from += piece;
        }
        Ok(())
    }

    /// Split `data` into block-aligned `WRITE_DATA` pieces and stream them,
    /// honoring the in-flight window.
    async fn stream_pieces(&mut self, chunk_id: u64, offset: u32, data: &[u8]) -> Result<()> {
        let mut cursor = 0usize;
        while cursor < data.len() {
            let absolute = offset as usize + cursor;
            let block = (absolute / BLOCK_SIZE as usize) as u16;
            let offset_in_block = (absolute % BLOCK_SIZE as usize) as u32;
            let piece = std::cmp::min(
                data.len() - cursor,
                (BLOCK_SIZE - offset_in_block) as usize,
            );
            let payload = Bytes::copy_from_slice(&data[cursor..cursor + piece]);

            self.wait_for_window().await?;

            let write_id = self.next_write_id;
            self.next_write_id += 1;
            let address = self.head.ok_or(FsError::Io("pipeline not open".into()))?;
            let channel = self.channel.as_mut().ok_or(FsError::Io("pipeline not open".into()))?;
            let mut client = ChunkserverClient::new(&mut **channel, address);
            if let Err(err) =
                client.write_block(chunk_id, write_id, block, offset_in_block, payload).await
            {
                self.fail();
                return Err(err);
            }
            self.unacked.insert(write_id);
            cursor += piece;
        }
        Ok(())
    }

    /// Drain acks, close the pipeline and give the lock back to the
    /// master. Leaves the writer reusable (Idle).
    pub async fn flush(&mut self) -> Result<()> {
        match self.state {
            WriteState::Idle => return Ok(()),
            WriteState::Failing => return Err(FsError::Io("write pipeline already failed".into())),
            _ => {}
        }
        self.state = WriteState::Flushing;

        while !self.unacked.is_empty() {
            self.collect_one_ack().await?;
        }

        // close the data pipeline
        if let (Some(address), Some(mut channel)) = (self.head, self.channel.take()) {
            let ticket = self.ticket.as_ref().ok_or(FsError::LockId)?;
            let mut client = ChunkserverClient::new(&mut *channel, address);
            if let Err(err) = client.write_end(ticket.chunk_id).await {
                self.fail();
                return Err(err);
            }
            self.stats.unregister_write_operation(address);
            self.pool.release(address, channel);
        }
        self.head = None;

        self.state = WriteState::ReleaseLock;
        self.release_lock().await?;

        // the chunk's version changed; readers must resolve afresh
        self.locator.invalidate(self.inode, self.chunk_index);
        self.state = WriteState::Idle;
        self.ticket = None;
        self.next_write_id = 1;
        Ok(())
    }

    /// File length as observed by this pipeline (what WRITE_CHUNK_END will
    /// report to the master).
    pub fn file_length(&self) -> u64 {
        let ticket_length = self.ticket.as_ref().map(|ticket| ticket.file_length).unwrap_or(0);
        std::cmp::max(ticket_length, self.end_of_data)
    }

    async fn ensure_streaming(&mut self) -> Result<()> {
        if self.state == WriteState::Streaming || self.state == WriteState::Flushing {
            self.state = WriteState::Streaming;
            return Ok(());
        }
        self.state = WriteState::AcquireLock;
        let ticket = self.acquire_lock(None).await?;

        // the chain head is the only server we talk to
        let head = ticket
            .chain
            .first()
            .map(|location| location.address)
            .ok_or(FsError::NoValidCopies)?;
        let chain_tail: Vec<NetworkAddress> =
            ticket.chain.iter().skip(1).map(|location| location.address).collect();
        let part_type = ticket.chain[0].part_type;

        let mut channel = self.pool.acquire(head, self.config.connect_timeout).await?;
        let mut client = ChunkserverClient::new(&mut *channel, head);
        if let Err(err) =
            client.write_init(ticket.chunk_id, ticket.version, part_type, chain_tail).await
        {
            self.state = WriteState::Failing;
            return Err(err);
        }
        self.stats.register_write_operation(head);

        self.end_of_data = ticket.file_length;
        self.ticket = Some(ticket);
        self.channel = Some(channel);
        self.head = Some(head);
        self.next_write_id = 1;
        self.unacked.clear();
        self.state = WriteState::Streaming;
        Ok(())
    }

    /// `WRITE_CHUNK` with LOCKED backoff. `previous_lock_id` refreshes an
    /// existing ticket in place.
    async fn acquire_lock(&mut self, previous_lock_id: Option<u32>) -> Result<WriteTicket> {
        let mut attempt = 0u32;
        loop {
            let response = self
                .master
                .request(MasterRequest::WriteChunk {
                    inode: self.inode,
                    chunk_index: self.chunk_index,
                    lock_id: previous_lock_id,
                })
                .await;
            match response {
                Ok(MasterResponse::WriteChunkGranted {
                    file_length,
                    chunk_id,
                    version,
                    lock_id,
                    chain,
                }) => {
                    debug!(
                        "chunk {:#x} v{} locked ({}) for inode {} index {}",
                        chunk_id, version, lock_id, self.inode, self.chunk_index
                    );
                    return Ok(WriteTicket { chunk_id, version, lock_id, file_length, chain });
                }
                Ok(_) => return Err(FsError::Protocol("unexpected write chunk reply".into())),
                Err(FsError::ChunkserverOverloaded) => {
                    // the chunk is locked by someone else; retry with backoff
                    attempt += 1;
                    if attempt > self.config.io_retries {
                        self.state = WriteState::Failing;
                        return Err(FsError::ChunkserverOverloaded);
                    }
                    let backoff = std::cmp::min(100 * attempt as u64, 1000);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    self.state = WriteState::Failing;
                    return Err(err);
                }
            }
        }
    }

    async fn release_lock(&mut self) -> Result<()> {
        let ticket = self.ticket.as_ref().ok_or(FsError::LockId)?.clone();
        let file_length = self.file_length();
        match self.write_chunk_end(&ticket, file_length).await {
            Ok(()) => Ok(()),
            Err(FsError::LockId) => {
                // refresh the ticket once, then give up
                warn!(
                    "master rejected lock id {} for chunk {:#x}, refreshing",
                    ticket.lock_id, ticket.chunk_id
                );
                let fresh = self.acquire_lock(Some(ticket.lock_id)).await?;
                let result = self.write_chunk_end(&fresh, file_length).await;
                self.ticket = Some(fresh);
                match result {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        self.fail();
                        Err(FsError::Io("chunk release failed twice".into()))
                    }
                }
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    async fn write_chunk_end(&self, ticket: &WriteTicket, file_length: u64) -> Result<()> {
        match self
            .master
            .request(MasterRequest::WriteChunkEnd {
                chunk_id: ticket.chunk_id,
                lock_id: ticket.lock_id,
                inode: self.inode,
                file_length,
            })
            .await?
        {
            MasterResponse::Done => Ok(()),
            _ => Err(FsError::Protocol("unexpected write chunk end reply".into())),
        }
    }

    async fn wait_for_window(&mut self) -> Result<()> {
        while self.unacked.len() >= self.config.window_size {
            self.collect_one_ack().await?;
        }
        Ok(())
    }

    async fn collect_one_ack(&mut self) -> Result<()> {
        let ticket = self.ticket.as_ref().ok_or(FsError::LockId)?;
        let chunk_id = ticket.chunk_id;
        let address = self.head.ok_or(FsError::Io("pipeline not open".into()))?;
        let channel = self.channel.as_mut().ok_or(FsError::Io("pipeline not open".into()))?;
        let mut client = ChunkserverClient::new(&mut **channel, address);
        match client.next_write_status(chunk_id).await {
            Ok((write_id, Status::Ok)) => {
                // acks may arrive out of order
                if !self.unacked.remove(&write_id) {
                    warn!("duplicate ack for write id {} on chunk {:#x}", write_id, chunk_id);
                }
                Ok(())
            }
            Ok((write_id, status)) => {
                warn!(
                    "chunkserver rejected write id {} on chunk {:#x}: {:?}",
                    write_id, chunk_id, status
                );
                self.fail();
                Err(crate::error::status_to_error(status))
            }
            Err(err) => {
                self.stats.mark_defective(address);
                self.fail();
                Err(err)
            }
        }
    }

    /// Drop the ticket and the pipeline; the inode stays dirty and the
    /// caller surfaces an I/O error.
    fn fail(&mut self) {
        self.state = WriteState::Failing;
        if let Some(address) = self.head.take() {
            self.stats.unregister_write_operation(address);
        }
        self.channel = None;
        self.unacked.clear();
    }
}

/// Two-phase truncate through the master. Returns the new attributes.
pub async fn truncate(
    master: &Master,
    inode: Inode,
    opened: bool,
    uid: u32,
    gid: u32,
    length: u64,
) -> Result<Attributes> {
    let response = master
        .request(MasterRequest::TruncateBegin { inode, opened, uid, gid, length, lock_id: None })
        .await?;
    let lock_id = match response {
        MasterResponse::TruncateStarted { lock_id, .. } => lock_id,
        // small files may truncate in one phase
        MasterResponse::Attributes(attributes) => return Ok(attributes),
        _ => return Err(FsError::Protocol("unexpected truncate reply".into())),
    };
    match master
        .request(MasterRequest::TruncateEnd { inode, uid, gid, length, lock_id })
        .await?
    {
        MasterResponse::Attributes(attributes) => Ok(attributes),
        _ => Err(FsError::Protocol("unexpected truncate end reply".into())),
    }
}
