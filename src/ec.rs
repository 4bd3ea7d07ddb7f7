//! Erasure coding used to reconstruct chunk data from partial part sets.
//!
//! The planner and executor only see the [`Codec`] trait; XOR and
//! Reed-Solomon are the two implementations. A codec works on one stripe at
//! a time: a slice of optional block buffers, data slots first, parity slots
//! after, with `None` marking the parts that were not delivered.

use crate::common::chunk_part::ChunkPartType;
use crate::error::{FsError, Result};

pub mod galois;
pub mod reed_solomon;
pub mod xor;

pub trait Codec: Send + Sync {
    /// Number of data slots per stripe.
    fn width(&self) -> usize;

    /// Number of parity slots per stripe.
    fn parity_count(&self) -> usize;

    /// Compute all parity blocks from a full set of data blocks.
    fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>>;

    /// Fill in the `None` slots of a stripe in place. `slots` holds
    /// `width() + parity_count()` entries, data first. Fails with
    /// `NoValidCopies` when more than `parity_count()` slots are missing.
    fn reconstruct(&self, slots: &mut [Option<Vec<u8>>], block_size: usize) -> Result<()>;
}

/// Codec matching a part type's redundancy set. Standard copies need no
/// decoding and yield `None`.
pub fn codec_for(part: &ChunkPartType) -> Option<Box<dyn Codec>> {
    match *part {
        ChunkPartType::Standard => None,
        ChunkPartType::Xor { level, .. } => Some(Box::new(xor::XorCodec::new(level))),
        ChunkPartType::Rs { k, m, .. } => Some(Box::new(reed_solomon::RsCodec::new(k, m))),
    }
}

pub(crate) fn check_slot_count(slots: &[Option<Vec<u8>>], expected: usize) -> Result<()> {
    if slots.len() != expected {
        return Err(FsError::Einval);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::chunk_part::ChunkPartType;

    #[test]
    fn codec_selection() {
        assert!(codec_for(&ChunkPartType::Standard).is_none());
        let xor = codec_for(&ChunkPartType::xor(3, 1).unwrap()).unwrap();
        assert_eq!((xor.width(), xor.parity_count()), (3, 1));
        let rs = codec_for(&ChunkPartType::rs(4, 2, 0).unwrap()).unwrap();
        assert_eq!((rs.width(), rs.parity_count()), (4, 2));
    }
}
