//! Executes a read plan: issues the wave requests concurrently, watches the
//! wave and total timers, validates what comes back and decodes stripes
//! that arrived incomplete.
//!
//! A transport failure on one replica never cancels the others; the
//! executor advances the wave schedule instead. A CRC failure aborts the
//! whole execution so the caller can drop the poisoned location and
//! re-plan without the offending replica.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};

use crate::common::chunk_part::{blocks_in_chunk, locate_block, ChunkPartType};
use crate::common::chunkserver_stats::ChunkserverStats;
use crate::cs::{ChunkserverClient, ConnectionPool};
use crate::ec::codec_for;
use crate::error::{FsError, Result};
use crate::protocol::{NetworkAddress, BLOCK_SIZE};

use super::planner::{PartRequest, ReadPlan};

#[derive(Clone, Copy, Debug)]
pub struct ReadTimeouts {
    pub connect: Duration,
    pub wave: Duration,
    pub total: Duration,
}

impl Default for ReadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(1000),
            wave: Duration::from_millis(500),
            total: Duration::from_millis(30_000),
        }
    }
}

/// Unregisters the pending read on drop, so cancelled request futures
/// cannot leak pending-operation counts.
struct ReadOpGuard {
    stats: Arc<ChunkserverStats>,
    address: NetworkAddress,
}

impl ReadOpGuard {
    fn register(stats: Arc<ChunkserverStats>, address: NetworkAddress) -> Self {
        stats.register_read_operation(address);
        Self { stats, address }
    }
}

impl Drop for ReadOpGuard {
    fn drop(&mut self) {
        self.stats.unregister_read_operation(self.address);
    }
}

pub struct ReadPlanExecutor {
    stats: Arc<ChunkserverStats>,
    chunk_id: u64,
    version: u32,
    plan: ReadPlan,
}

type RequestOutcome = (PartRequest, Result<Vec<(u32, Bytes)>>);

impl ReadPlanExecutor {
    pub fn new(stats: Arc<ChunkserverStats>, chunk_id: u64, version: u32, plan: ReadPlan) -> Self {
        Self { stats, chunk_id, version, plan }
    }

    /// Run the plan to completion. Returns `total_blocks() * BLOCK_SIZE`
    /// bytes; the caller truncates to the byte range it wanted.
    pub async fn execute(
        &self,
        pool: &ConnectionPool,
        timeouts: &ReadTimeouts,
        chunk_length: u32,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let deadline = started + timeouts.total;
        // absolute part-block index -> payload, per part type
        let mut delivered: HashMap<ChunkPartType, HashMap<u32, Bytes>> = HashMap::new();
        let mut launched: HashSet<(ChunkPartType, NetworkAddress)> = HashSet::new();
        let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();
        let mut next_wave = 0usize;
        let mut next_wave_at = self.plan.waves.first().map(|wave| started + wave.delay);
        let mut last_error: Option<FsError> = None;

        loop {
            if self.assembly_possible(&delivered, chunk_length) {
                return self.assemble(&delivered, chunk_length);
            }

            // launch every wave whose time has come
            while let Some(at) = next_wave_at {
                if at > Instant::now() {
                    break;
                }
                let wave = &self.plan.waves[next_wave];
                for request in &wave.requests {
                    if !launched.insert((request.part_type, request.address)) {
                        continue;
                    }
                    in_flight.push(self.run_request(
                        pool,
                        *request,
                        timeouts.connect,
                        chunk_length,
                    ));
                }
                next_wave += 1;
                next_wave_at =
                    self.plan.waves.get(next_wave).map(|wave| started + wave.delay);
            }

            if in_flight.is_empty() && next_wave_at.is_none() {
                // nothing running and nothing left to try
                return Err(last_error.take().unwrap_or(FsError::NoValidCopies));
            }

            let sleep_until = match next_wave_at {
                Some(at) => std::cmp::min(at, deadline),
                None => deadline,
            };

            tokio::select! {
                outcome = in_flight.next(), if !in_flight.is_empty() => {
                    let (request, result) = match outcome {
                        Some(outcome) => outcome,
                        None => continue,
                    };
                    match result {
                        Ok(blocks) => {
                            self.stats.mark_working(request.address);
                            let part_blocks =
                                delivered.entry(request.part_type).or_insert_with(HashMap::new);
                            for (index, payload) in blocks {
                                part_blocks.insert(request.first_block + index, payload);
                            }
                        }
                        Err(err @ FsError::ChunkCrc { .. }) => {
                            // poisoned replica: the caller re-plans without it
                            self.stats.mark_defective(request.address);
                            return Err(err);
                        }
                        Err(err) => {
                            warn!(
                                "read of {} from {} failed: {}",
                                request.part_type, request.address, err
                            );
                            self.stats.mark_defective(request.address);
                            last_error = Some(err);
                            // a failure advances the wave schedule
                            if let Some(at) = next_wave_at.as_mut() {
                                *at = Instant::now();
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until.into()) => {
                    if Instant::now() >= deadline {
                        return Err(FsError::Timeout);
                    }
                }
            }
        }
    }

    async fn run_request(
        &self,
        pool: &ConnectionPool,
        request: PartRequest,
        connect_timeout: Duration,
        chunk_length: u32,
    ) -> RequestOutcome {
        let _guard = ReadOpGuard::register(Arc::clone(&self.stats), request.address);

        let part_length = request.part_type.part_length(chunk_length);
        let offset = request.first_block * BLOCK_SIZE;
        if part_length <= offset {
            return (request, Ok(Vec::new()));
        }
        let size = std::cmp::min(request.block_count * BLOCK_SIZE, part_length - offset);

        let mut channel = match pool.acquire(request.address, connect_timeout).await {
            Ok(channel) => channel,
            Err(err) => return (request, Err(err)),
        };
        let mut client = ChunkserverClient::new(&mut *channel, request.address);
        match client
            .read_blocks(self.chunk_id, self.version, request.part_type, offset, size)
            .await
        {
            Ok(blocks) => {
                pool.release(request.address, channel);
                let blocks = blocks.into_iter().map(|block| (block.index, block.payload)).collect();
                (request, Ok(blocks))
            }
            // a partial reply leaves the connection desynchronized; drop it
            Err(err) => (request, Err(err)),
        }
    }

    /// Can every requested block be produced from what has arrived?
    fn assembly_possible(
        &self,
        delivered: &HashMap<ChunkPartType, HashMap<u32, Bytes>>,
        chunk_length: u32,
    ) -> bool {
        let representative = match self.representative() {
            Some(part) => part,
            None => return false,
        };
        let blocks_total = blocks_in_chunk(chunk_length);
        let first = self.plan.first_block;
        let last = first + self.plan.total_blocks();
        (first..last).all(|block| {
            block >= blocks_total
                || self.block_available(&representative, block, delivered, blocks_total)
        })
    }

    fn block_available(
        &self,
        representative: &ChunkPartType,
        block: u32,
        delivered: &HashMap<ChunkPartType, HashMap<u32, Bytes>>,
        blocks_total: u32,
    ) -> bool {
        let (part, part_block) = locate_block(representative, block);
        if delivered.get(&part).map_or(false, |blocks| blocks.contains_key(&part_block)) {
            return true;
        }
        let width = representative.stripe_width() as usize;
        if width == 1 {
            return false;
        }
        // whole-stripe decode: enough distinct parts delivered this stripe?
        let stripe = block / representative.stripe_width();
        let present = representative
            .siblings()
            .iter()
            .filter(|sibling| {
                self.slot_payload(sibling, stripe, delivered, blocks_total).is_some()
            })
            .count();
        present >= width
    }

    /// Delivered payload for `part`'s block of stripe `stripe`. Stripes a
    /// part does not carry count as implicit zero blocks.
    fn slot_payload<'a>(
        &self,
        part: &ChunkPartType,
        stripe: u32,
        delivered: &'a HashMap<ChunkPartType, HashMap<u32, Bytes>>,
        blocks_total: u32,
    ) -> Option<SlotData<'a>> {
        if part.blocks_carried(blocks_total) <= stripe {
            return Some(SlotData::Zero);
        }
        delivered.get(part).and_then(|blocks| blocks.get(&stripe)).map(SlotData::Payload)
    }

    fn assemble(
        &self,
        delivered: &HashMap<ChunkPartType, HashMap<u32, Bytes>>,
        chunk_length: u32,
    ) -> Result<Vec<u8>> {
        let representative = self.representative().ok_or(FsError::NoValidCopies)?;
        let blocks_total = blocks_in_chunk(chunk_length);
        let first = self.plan.first_block;
        let count = self.plan.total_blocks();
        let mut output = vec![0u8; (count * BLOCK_SIZE) as usize];

        let width = representative.stripe_width();
        let mut reconstructed: HashMap<u32, Vec<Option<Vec<u8>>>> = HashMap::new();

        for block in first..first + count {
            if block >= blocks_total {
                break; // trailing zeros already in place
            }
            let destination = ((block - first) * BLOCK_SIZE) as usize;
            let (part, part_block) = locate_block(&representative, block);
            if let Some(payload) = delivered.get(&part).and_then(|blocks| blocks.get(&part_block))
            {
                output[destination..destination + payload.len()].copy_from_slice(payload);
                continue;
            }

            // decode the stripe once and reuse it for its other blocks
            let stripe = block / width;
            if !reconstructed.contains_key(&stripe) {
                let slots =
                    self.decode_stripe(&representative, stripe, delivered, blocks_total)?;
                reconstructed.insert(stripe, slots);
            }
            let slots = &reconstructed[&stripe];
            let position = (block % width) as usize;
            match slots.get(position) {
                Some(Some(payload)) => {
                    let len = payload.len().min(BLOCK_SIZE as usize);
                    output[destination..destination + len].copy_from_slice(&payload[..len]);
                }
                _ => return Err(FsError::NoValidCopies),
            }
        }
        Ok(output)
    }

    fn decode_stripe(
        &self,
        representative: &ChunkPartType,
        stripe: u32,
        delivered: &HashMap<ChunkPartType, HashMap<u32, Bytes>>,
        blocks_total: u32,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let codec = codec_for(representative).ok_or(FsError::NoValidCopies)?;
        let slot_count = codec.width() + codec.parity_count();
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; slot_count];

        for sibling in representative.siblings() {
            let slot = slot_index(&sibling, codec.width());
            match self.slot_payload(&sibling, stripe, delivered, blocks_total) {
                Some(SlotData::Payload(payload)) => {
                    let mut block = payload.to_vec();
                    block.resize(BLOCK_SIZE as usize, 0);
                    slots[slot] = Some(block);
                }
                Some(SlotData::Zero) => {
                    slots[slot] = Some(vec![0u8; BLOCK_SIZE as usize]);
                }
                None => {}
            }
        }

        codec.reconstruct(&mut slots, BLOCK_SIZE as usize)?;
        debug!("reconstructed stripe {} of chunk {:#x}", stripe, self.chunk_id);
        Ok(slots)
    }

    fn representative(&self) -> Option<ChunkPartType> {
        self.plan
            .waves
            .iter()
            .flat_map(|wave| wave.requests.iter())
            .map(|request| request.part_type)
            .next()
    }
}

enum SlotData<'a> {
    Payload(&'a Bytes),
    Zero,
}

/// Slot layout for decoding: data positions first, parities after. RS
/// parity `part >= k` already sits at its slot index; the XOR parity goes
/// last.
fn slot_index(part: &ChunkPartType, width: usize) -> usize {
    match part.data_position() {
        Some(position) => position as usize,
        None => match *part {
            ChunkPartType::Xor { .. } => width,
            ChunkPartType::Rs { part, .. } => part as usize,
            ChunkPartType::Standard => 0,
        },
    }
}
