//! Identity and geometry of chunk parts.
//!
//! A chunk is stored either as a full standard copy, as one part of an XOR
//! set (level data parts plus one parity), or as one part of a Reed-Solomon
//! k+m set. All stripe arithmetic - how many blocks a part carries, how long
//! a part is for a given chunk length, which part holds a given block -
//! lives here.

use crate::error::{FsError, Result};
use crate::protocol::BLOCK_SIZE;

pub const XOR_MIN_LEVEL: u8 = 2;
pub const XOR_MAX_LEVEL: u8 = 9;
pub const RS_MIN_DATA: u8 = 2;
pub const RS_MAX_DATA: u8 = 10;
pub const RS_MIN_PARITY: u8 = 1;
pub const RS_MAX_PARITY: u8 = 4;

/// Part number 0 of an XOR set is the parity.
pub const XOR_PARITY_PART: u8 = 0;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ChunkPartType {
    Standard,
    /// `part` 0 is the parity, parts `1..=level` carry data.
    Xor { level: u8, part: u8 },
    /// Parts `0..k` carry data, parts `k..k + m` carry parity.
    Rs { k: u8, m: u8, part: u8 },
}

impl ChunkPartType {
    pub fn standard() -> Self {
        ChunkPartType::Standard
    }

    pub fn xor(level: u8, part: u8) -> Result<Self> {
        if level < XOR_MIN_LEVEL || level > XOR_MAX_LEVEL || part > level {
            return Err(FsError::Einval);
        }
        Ok(ChunkPartType::Xor { level, part })
    }

    pub fn xor_parity(level: u8) -> Result<Self> {
        Self::xor(level, XOR_PARITY_PART)
    }

    pub fn rs(k: u8, m: u8, part: u8) -> Result<Self> {
        if k < RS_MIN_DATA || k > RS_MAX_DATA || m < RS_MIN_PARITY || m > RS_MAX_PARITY {
            return Err(FsError::Einval);
        }
        if part >= k + m {
            return Err(FsError::Einval);
        }
        Ok(ChunkPartType::Rs { k, m, part })
    }

    /// Number of data parts in a stripe.
    pub fn stripe_width(&self) -> u32 {
        match *self {
            ChunkPartType::Standard => 1,
            ChunkPartType::Xor { level, .. } => level as u32,
            ChunkPartType::Rs { k, .. } => k as u32,
        }
    }

    /// How many parts of this part's set may be missing while the data
    /// still decodes.
    pub fn tolerance(&self) -> u32 {
        match *self {
            ChunkPartType::Standard => 0,
            ChunkPartType::Xor { .. } => 1,
            ChunkPartType::Rs { m, .. } => m as u32,
        }
    }

    pub fn is_parity(&self) -> bool {
        match *self {
            ChunkPartType::Standard => false,
            ChunkPartType::Xor { part, .. } => part == XOR_PARITY_PART,
            ChunkPartType::Rs { k, part, .. } => part >= k,
        }
    }

    /// Zero-based position of a data part inside its stripe. None for
    /// parity parts and standard copies.
    pub fn data_position(&self) -> Option<u32> {
        match *self {
            ChunkPartType::Standard => None,
            ChunkPartType::Xor { part, .. } if part != XOR_PARITY_PART => Some(part as u32 - 1),
            ChunkPartType::Rs { k, part, .. } if part < k => Some(part as u32),
            _ => None,
        }
    }

    /// Number of blocks this part carries when the whole chunk has
    /// `blocks_in_chunk` blocks.
    pub fn blocks_carried(&self, blocks_in_chunk: u32) -> u32 {
        match *self {
            ChunkPartType::Standard => blocks_in_chunk,
            ChunkPartType::Xor { level, part } => {
                let level = level as u32;
                // parity sits at the last position of the stripe
                let position = if part == XOR_PARITY_PART {
                    level - 1
                } else {
                    level - part as u32
                };
                (blocks_in_chunk + position) / level
            }
            ChunkPartType::Rs { k, part, .. } => {
                let k = k as u32;
                let position = if part as u32 >= k { k - 1 } else { k - 1 - part as u32 };
                (blocks_in_chunk + position) / k
            }
        }
    }

    /// Length in bytes of this part for a chunk of `chunk_length` bytes.
    ///
    /// The last stripe may be ragged: a data part's final block is partial
    /// when the chunk ends inside it, and the parity block mirrors the
    /// longest data block of the stripe.
    pub fn part_length(&self, chunk_length: u32) -> u32 {
        let width = self.stripe_width();
        if width == 1 {
            return chunk_length;
        }
        let stripe_bytes = width * BLOCK_SIZE;
        let full_stripes = chunk_length / stripe_bytes;
        let base_len = full_stripes * BLOCK_SIZE;
        let rest = chunk_length - full_stripes * stripe_bytes;

        let skipped = match self.data_position() {
            Some(position) => position,
            None => 0, // parity mirrors the first (longest) data block
        };
        let rest_len = (rest as i64 - (skipped * BLOCK_SIZE) as i64)
            .max(0)
            .min(BLOCK_SIZE as i64) as u32;
        base_len + rest_len
    }

    /// All part types belonging to the same redundancy set as `self`.
    pub fn siblings(&self) -> Vec<ChunkPartType> {
        match *self {
            ChunkPartType::Standard => vec![ChunkPartType::Standard],
            ChunkPartType::Xor { level, .. } => (0..=level)
                .map(|part| ChunkPartType::Xor { level, part })
                .collect(),
            ChunkPartType::Rs { k, m, .. } => (0..k + m)
                .map(|part| ChunkPartType::Rs { k, m, part })
                .collect(),
        }
    }
}

impl std::fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            ChunkPartType::Standard => write!(f, "standard"),
            ChunkPartType::Xor { level, part } if part == XOR_PARITY_PART => {
                write!(f, "xor_parity_of_{}", level)
            }
            ChunkPartType::Xor { level, part } => write!(f, "xor_{}_of_{}", part, level),
            ChunkPartType::Rs { k, m, part } => write!(f, "rs_{}_of_{}+{}", part, k, m),
        }
    }
}

/// Number of blocks needed to hold `chunk_length` bytes.
pub fn blocks_in_chunk(chunk_length: u32) -> u32 {
    (chunk_length + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Which data part of `set_representative`'s set holds chunk block
/// `block`, and at which block offset inside that part.
pub fn locate_block(set_representative: &ChunkPartType, block: u32) -> (ChunkPartType, u32) {
    match *set_representative {
        ChunkPartType::Standard => (ChunkPartType::Standard, block),
        ChunkPartType::Xor { level, .. } => {
            let width = level as u32;
            let part = (block % width) as u8 + 1;
            (ChunkPartType::Xor { level, part }, block / width)
        }
        ChunkPartType::Rs { k, m, .. } => {
            let width = k as u32;
            let part = (block % width) as u8;
            (ChunkPartType::Rs { k, m, part }, block / width)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CHUNK_SIZE;

    #[test]
    fn invalid_parameters_rejected() {
        assert!(ChunkPartType::xor(1, 0).is_err());
        assert!(ChunkPartType::xor(10, 0).is_err());
        assert!(ChunkPartType::xor(3, 4).is_err());
        assert!(ChunkPartType::rs(1, 1, 0).is_err());
        assert!(ChunkPartType::rs(4, 5, 0).is_err());
        assert!(ChunkPartType::rs(4, 2, 6).is_err());
    }

    #[test]
    fn xor_blocks_carried() {
        // 7 blocks over xor level 3: stripes are [1,2,3][4,5,6][7]
        let level = 3;
        assert_eq!(ChunkPartType::xor(level, 1).unwrap().blocks_carried(7), 3);
        assert_eq!(ChunkPartType::xor(level, 2).unwrap().blocks_carried(7), 2);
        assert_eq!(ChunkPartType::xor(level, 3).unwrap().blocks_carried(7), 2);
        assert_eq!(ChunkPartType::xor_parity(level).unwrap().blocks_carried(7), 3);
    }

    #[test]
    fn rs_blocks_carried() {
        // 5 blocks over rs 2+2: data part 0 holds blocks 0,2,4; part 1 holds 1,3
        let p0 = ChunkPartType::rs(2, 2, 0).unwrap();
        let p1 = ChunkPartType::rs(2, 2, 1).unwrap();
        let parity = ChunkPartType::rs(2, 2, 2).unwrap();
        assert_eq!(p0.blocks_carried(5), 3);
        assert_eq!(p1.blocks_carried(5), 2);
        assert_eq!(parity.blocks_carried(5), 3);
    }

    #[test]
    fn part_length_sums() {
        // Property: the data parts of a set jointly cover the chunk, each
        // parity adds one block-length-or-less per stripe.
        for &chunk_length in
            &[0u32, 1, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1, 10 * BLOCK_SIZE + 17, CHUNK_SIZE]
        {
            assert_eq!(ChunkPartType::Standard.part_length(chunk_length), chunk_length);

            for level in XOR_MIN_LEVEL..=XOR_MAX_LEVEL {
                let data_sum: u64 = (1..=level)
                    .map(|p| ChunkPartType::xor(level, p).unwrap().part_length(chunk_length) as u64)
                    .sum();
                assert_eq!(data_sum, chunk_length as u64, "xor level {}", level);
                let parity = ChunkPartType::xor_parity(level).unwrap().part_length(chunk_length);
                let total = data_sum + parity as u64;
                assert!(total >= chunk_length as u64);
            }

            let (k, m) = (4u8, 2u8);
            let data_sum: u64 = (0..k)
                .map(|p| ChunkPartType::rs(k, m, p).unwrap().part_length(chunk_length) as u64)
                .sum();
            assert_eq!(data_sum, chunk_length as u64);
        }
    }

    #[test]
    fn parity_block_full_iff_any_data_block_full() {
        // one and a half blocks over xor level 2: part1 full, part2 half
        let len = BLOCK_SIZE + BLOCK_SIZE / 2;
        assert_eq!(ChunkPartType::xor(2, 1).unwrap().part_length(len), BLOCK_SIZE);
        assert_eq!(ChunkPartType::xor(2, 2).unwrap().part_length(len), BLOCK_SIZE / 2);
        assert_eq!(ChunkPartType::xor_parity(2).unwrap().part_length(len), BLOCK_SIZE);

        // less than one block: parity is as short as the only data block
        let len = BLOCK_SIZE / 4;
        assert_eq!(ChunkPartType::xor_parity(2).unwrap().part_length(len), len);
    }

    #[test]
    fn block_location_roundtrip() {
        let set = ChunkPartType::xor(3, 1).unwrap();
        assert_eq!(locate_block(&set, 0), (ChunkPartType::xor(3, 1).unwrap(), 0));
        assert_eq!(locate_block(&set, 1), (ChunkPartType::xor(3, 2).unwrap(), 0));
        assert_eq!(locate_block(&set, 5), (ChunkPartType::xor(3, 3).unwrap(), 1));

        let set = ChunkPartType::rs(4, 2, 0).unwrap();
        assert_eq!(locate_block(&set, 6), (ChunkPartType::rs(4, 2, 2).unwrap(), 1));
    }
}
