//! XOR parity: one parity block per stripe, tolerating a single missing
//! part.

use crate::error::{FsError, Result};

use super::{check_slot_count, Codec};

/// XOR dest in place with source over the common prefix. Short buffers are
/// treated as zero-padded, which matches ragged last-stripe blocks.
pub fn block_xor(dest: &mut [u8], source: &[u8]) {
    let n = dest.len().min(source.len());
    for i in 0..n {
        dest[i] ^= source[i];
    }
}

pub struct XorCodec {
    level: u8,
}

impl XorCodec {
    pub fn new(level: u8) -> Self {
        Self { level }
    }
}

impl Codec for XorCodec {
    fn width(&self) -> usize {
        self.level as usize
    }

    fn parity_count(&self) -> usize {
        1
    }

    fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.width() {
            return Err(FsError::Einval);
        }
        let len = data.iter().map(|d| d.len()).max().unwrap_or(0);
        let mut parity = vec![0u8; len];
        for block in data {
            block_xor(&mut parity, block);
        }
        Ok(vec![parity])
    }

    fn reconstruct(&self, slots: &mut [Option<Vec<u8>>], block_size: usize) -> Result<()> {
        check_slot_count(slots, self.width() + 1)?;
        let missing: Vec<usize> =
            (0..slots.len()).filter(|i| slots[*i].is_none()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        if missing.len() > 1 {
            return Err(FsError::NoValidCopies);
        }
        let target = missing[0];
        let mut block = vec![0u8; block_size];
        for (i, slot) in slots.iter().enumerate() {
            if i == target {
                continue;
            }
            if let Some(data) = slot {
                block_xor(&mut block, data);
            }
        }
        slots[target] = Some(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stripe(level: u8, block_size: usize) -> Vec<Vec<u8>> {
        (0..level).map(|p| vec![p.wrapping_mul(37).wrapping_add(1); block_size]).collect()
    }

    #[test]
    fn recovers_any_single_missing_slot() {
        let level = 3u8;
        let data = stripe(level, 64);
        let codec = XorCodec::new(level);
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let parity = codec.encode(&refs).unwrap().remove(0);

        for lost in 0..=level as usize {
            let mut slots: Vec<Option<Vec<u8>>> =
                data.iter().cloned().map(Some).chain(std::iter::once(Some(parity.clone()))).collect();
            slots[lost] = None;
            codec.reconstruct(&mut slots, 64).unwrap();
            let expected = if lost == level as usize { &parity } else { &data[lost] };
            assert_eq!(slots[lost].as_ref().unwrap(), expected);
        }
    }

    #[test]
    fn two_missing_slots_fail() {
        let codec = XorCodec::new(2);
        let mut slots = vec![Some(vec![1u8; 8]), None, None];
        assert!(matches!(codec.reconstruct(&mut slots, 8), Err(FsError::NoValidCopies)));
    }

    #[test]
    fn ragged_blocks_are_zero_padded() {
        let codec = XorCodec::new(2);
        let full = vec![0xaau8; 16];
        let short = vec![0x55u8; 4];
        let parity = codec.encode(&[&full, &short]).unwrap().remove(0);
        assert_eq!(parity.len(), 16);
        assert_eq!(&parity[..4], &[0xffu8; 4][..]);
        assert_eq!(&parity[4..], &full[4..]);
    }
}
