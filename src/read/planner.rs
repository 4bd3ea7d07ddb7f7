//! Read planning: which parts to ask, in what order, with what backoff.
//!
//! Wave 0 requests the cheapest set of parts sufficient to decode the
//! requested blocks. Later waves are fallbacks that fire after a timeout,
//! substituting alternates for whatever has not been delivered yet. A plan
//! only exists when enough distinct parts are reachable; otherwise planning
//! fails with `NoValidCopies` before any network traffic happens.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::common::chunk_part::{blocks_in_chunk, ChunkPartType};
use crate::error::{FsError, Result};
use crate::protocol::NetworkAddress;

/// One reachable (part, replica) pair with its current planner inputs.
#[derive(Clone, Copy, Debug)]
pub struct PartInstance {
    pub part_type: ChunkPartType,
    pub address: NetworkAddress,
    pub score: f32,
    pub pending_ops: u32,
}

/// A single request of a wave: a block range inside one part on one
/// chunkserver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PartRequest {
    pub part_type: ChunkPartType,
    pub address: NetworkAddress,
    /// Block index inside the part.
    pub first_block: u32,
    pub block_count: u32,
}

#[derive(Clone, Debug)]
pub struct Wave {
    pub delay: Duration,
    pub requests: Vec<PartRequest>,
}

#[derive(Clone, Debug)]
pub struct ReadPlan {
    /// Requested range, in chunk blocks.
    pub first_block: u32,
    pub block_count: u32,
    /// Extra blocks past the requested range, already clamped to the end of
    /// the chunk data. They are read opportunistically and cached, never
    /// returned to the caller.
    pub prefetch_blocks: u32,
    pub waves: Vec<Wave>,
}

impl ReadPlan {
    pub fn total_blocks(&self) -> u32 {
        self.block_count + self.prefetch_blocks
    }
}

pub struct ReadPlanner {
    wave_timeout: Duration,
}

/// Defect-adjusted score first, then fewer pending operations, then the
/// lexicographically lowest address.
fn better_instance(a: &PartInstance, b: &PartInstance) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.pending_ops.cmp(&b.pending_ops))
        .then(a.address.cmp(&b.address))
}

impl ReadPlanner {
    pub fn new(wave_timeout: Duration) -> Self {
        Self { wave_timeout }
    }

    /// Build a plan for reading `block_count` blocks starting at
    /// `first_block` of a chunk that carries `chunk_length` bytes.
    /// `prefetch_window` (bytes) optionally widens the range; the widening
    /// is clamped so it never crosses the end of the chunk data.
    pub fn plan(
        &self,
        first_block: u32,
        block_count: u32,
        chunk_length: u32,
        instances: &[PartInstance],
        prefetch_window: u32,
    ) -> Result<ReadPlan> {
        if block_count == 0 {
            return Err(FsError::Einval);
        }
        let blocks_total = blocks_in_chunk(chunk_length);
        if first_block + block_count > blocks_total {
            return Err(FsError::Einval);
        }

        let prefetch_blocks = std::cmp::min(
            prefetch_window / crate::protocol::BLOCK_SIZE,
            blocks_total - (first_block + block_count),
        );

        // best-first instance list per part type
        let mut by_part: BTreeMap<ChunkPartType, Vec<PartInstance>> = BTreeMap::new();
        for instance in instances {
            by_part.entry(instance.part_type).or_insert_with(Vec::new).push(*instance);
        }
        for list in by_part.values_mut() {
            list.sort_by(better_instance);
        }

        let waves = if by_part.contains_key(&ChunkPartType::Standard) {
            self.plan_standard(first_block, block_count + prefetch_blocks, &by_part)
        } else {
            self.plan_striped(
                first_block,
                block_count + prefetch_blocks,
                blocks_total,
                &by_part,
            )?
        };

        if waves.is_empty() || waves[0].requests.is_empty() {
            return Err(FsError::NoValidCopies);
        }

        Ok(ReadPlan { first_block, block_count, prefetch_blocks, waves })
    }

    /// Standard copies: one replica per wave, best first.
    fn plan_standard(
        &self,
        first_block: u32,
        block_count: u32,
        by_part: &BTreeMap<ChunkPartType, Vec<PartInstance>>,
    ) -> Vec<Wave> {
        let replicas = &by_part[&ChunkPartType::Standard];
        replicas
            .iter()
            .enumerate()
            .map(|(index, replica)| Wave {
                delay: self.wave_timeout * index as u32,
                requests: vec![PartRequest {
                    part_type: ChunkPartType::Standard,
                    address: replica.address,
                    first_block,
                    block_count,
                }],
            })
            .collect()
    }

    /// XOR / Reed-Solomon parts.
    fn plan_striped(
        &self,
        first_block: u32,
        block_count: u32,
        blocks_total: u32,
        by_part: &BTreeMap<ChunkPartType, Vec<PartInstance>>,
    ) -> Result<Vec<Wave>> {
        let representative = match by_part.keys().next() {
            Some(part) => *part,
            None => return Err(FsError::NoValidCopies),
        };
        let width = representative.stripe_width();
        let tolerance = representative.tolerance();

        // the data parts the requested range actually touches
        let touched: Vec<ChunkPartType> = representative
            .siblings()
            .into_iter()
            .filter(|sibling| {
                sibling.data_position().map_or(false, |position| {
                    part_block_range(first_block, block_count, width, position, blocks_total)
                        .is_some()
                })
            })
            .collect();

        let all_touched_available = touched.iter().all(|part| by_part.contains_key(part));

        let mut wave0: Vec<PartRequest> = Vec::new();
        let mut used_parts: Vec<ChunkPartType> = Vec::new();

        if all_touched_available {
            // direct reads of exactly the covering data parts
            for part in &touched {
                let position = part.data_position().unwrap_or(0);
                if let Some((part_first, part_count)) =
                    part_block_range(first_block, block_count, width, position, blocks_total)
                {
                    wave0.push(PartRequest {
                        part_type: *part,
                        address: by_part[part][0].address,
                        first_block: part_first,
                        block_count: part_count,
                    });
                    used_parts.push(*part);
                }
            }
        } else {
            // reconstruction: any `width` distinct parts over the stripe range
            if (by_part.len() as u32) < width {
                return Err(FsError::NoValidCopies);
            }
            let mut candidates: Vec<(&ChunkPartType, &PartInstance)> =
                by_part.iter().map(|(part, list)| (part, &list[0])).collect();
            // prefer data parts so less decoding is needed, then score order
            candidates.sort_by(|a, b| {
                a.0.is_parity()
                    .cmp(&b.0.is_parity())
                    .then(better_instance(a.1, b.1))
            });
            for (part, instance) in candidates.into_iter().take(width as usize) {
                if let Some((part_first, part_count)) =
                    stripe_span(first_block, block_count, width, part, blocks_total)
                {
                    wave0.push(PartRequest {
                        part_type: *part,
                        address: instance.address,
                        first_block: part_first,
                        block_count: part_count,
                    });
                }
                used_parts.push(*part);
            }
        }

        let mut waves = vec![Wave { delay: Duration::from_millis(0), requests: wave0 }];
        let mut wave_index = 1u32;

        if all_touched_available {
            // Losing a directly-read data part forces a stripe decode, so
            // the fallback brings every remaining part of the set at once.
            let requests: Vec<PartRequest> = by_part
                .iter()
                .filter(|(part, _)| !used_parts.contains(part))
                .filter_map(|(part, list)| {
                    stripe_span(first_block, block_count, width, part, blocks_total).map(
                        |(part_first, part_count)| PartRequest {
                            part_type: *part,
                            address: list[0].address,
                            first_block: part_first,
                            block_count: part_count,
                        },
                    )
                })
                .collect();
            if !requests.is_empty() {
                waves.push(Wave { delay: self.wave_timeout, requests });
                wave_index = 2;
            }
        } else {
            // Reconstruction already in progress: substitute one alternate
            // part per wave, while losses stay within tolerance.
            for (part, list) in by_part.iter() {
                if used_parts.contains(part) {
                    continue;
                }
                if wave_index > tolerance {
                    break;
                }
                if let Some((part_first, part_count)) =
                    stripe_span(first_block, block_count, width, part, blocks_total)
                {
                    waves.push(Wave {
                        delay: self.wave_timeout * wave_index,
                        requests: vec![PartRequest {
                            part_type: *part,
                            address: list[0].address,
                            first_block: part_first,
                            block_count: part_count,
                        }],
                    });
                    wave_index += 1;
                }
            }
        }

        // second-best replicas of already used parts extend the tail waves
        for part in &used_parts {
            if let Some(alternate) = by_part[part].get(1) {
                if let Some((part_first, part_count)) =
                    stripe_span(first_block, block_count, width, part, blocks_total)
                {
                    waves.push(Wave {
                        delay: self.wave_timeout * wave_index,
                        requests: vec![PartRequest {
                            part_type: *part,
                            address: alternate.address,
                            first_block: part_first,
                            block_count: part_count,
                        }],
                    });
                    wave_index += 1;
                }
            }
        }

        Ok(waves)
    }
}

/// Block range of data position `position` inside its part for the chunk
/// block range `[first, first + count)`, or None when untouched. The range
/// is clamped to the blocks the part actually carries.
fn part_block_range(
    first: u32,
    count: u32,
    width: u32,
    position: u32,
    blocks_total: u32,
) -> Option<(u32, u32)> {
    let last = first + count - 1;
    let first_stripe = if first % width <= position { first / width } else { first / width + 1 };
    let last_stripe = if last % width >= position { last / width } else { (last / width).checked_sub(1)? };
    if first_stripe > last_stripe {
        return None;
    }
    // the part might not carry the trailing stripe at all
    let carried = carried_stripes(width, position, blocks_total)?;
    let last_stripe = std::cmp::min(last_stripe, carried - 1);
    if first_stripe > last_stripe {
        return None;
    }
    Some((first_stripe, last_stripe - first_stripe + 1))
}

/// Full stripe span `[first/width, last/width]` of a part, clamped to what
/// it carries.
fn stripe_span(
    first: u32,
    count: u32,
    width: u32,
    part: &ChunkPartType,
    blocks_total: u32,
) -> Option<(u32, u32)> {
    let first_stripe = first / width;
    let last_stripe = (first + count - 1) / width;
    let carried = part.blocks_carried(blocks_total);
    if carried == 0 || first_stripe >= carried {
        return None;
    }
    let last_stripe = std::cmp::min(last_stripe, carried - 1);
    Some((first_stripe, last_stripe - first_stripe + 1))
}

fn carried_stripes(width: u32, position: u32, blocks_total: u32) -> Option<u32> {
    // data position p carries ceil((blocks_total - p) / width) blocks
    if blocks_total <= position {
        return None;
    }
    Some((blocks_total - position + width - 1) / width)
}
