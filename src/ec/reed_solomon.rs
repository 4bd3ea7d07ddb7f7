//! Systematic Reed-Solomon over GF(2^8).
//!
//! The generator is `[I; C]` where `C` is an m x k Cauchy matrix
//! (`c[j][i] = 1 / (x_j + y_i)` with `x_j = k + j`, `y_i = i`). Every
//! square submatrix of a Cauchy matrix is invertible, so any k of the
//! k + m parts decode.

use crate::error::{FsError, Result};

use super::galois::{gf_inv, gf_mul, mul_acc};
use super::{check_slot_count, Codec};

pub struct RsCodec {
    k: usize,
    m: usize,
    /// m rows of k coefficients
    parity_rows: Vec<Vec<u8>>,
}

impl RsCodec {
    pub fn new(k: u8, m: u8) -> Self {
        let (k, m) = (k as usize, m as usize);
        let parity_rows = (0..m)
            .map(|j| (0..k).map(|i| gf_inv((k + j) as u8 ^ i as u8)).collect())
            .collect();
        Self { k, m, parity_rows }
    }

    /// Generator row of part `index` (data rows are unit vectors).
    fn generator_row(&self, index: usize) -> Vec<u8> {
        if index < self.k {
            let mut row = vec![0u8; self.k];
            row[index] = 1;
            row
        } else {
            self.parity_rows[index - self.k].clone()
        }
    }
}

/// Invert a square matrix over GF(2^8) by Gauss-Jordan elimination.
fn invert(matrix: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut work: Vec<Vec<u8>> = matrix.to_vec();
    let mut inverse: Vec<Vec<u8>> = (0..n)
        .map(|i| {
            let mut row = vec![0u8; n];
            row[i] = 1;
            row
        })
        .collect();

    for col in 0..n {
        // pivot
        let pivot = (col..n).find(|&r| work[r][col] != 0).ok_or(FsError::NoValidCopies)?;
        work.swap(col, pivot);
        inverse.swap(col, pivot);

        let inv_pivot = gf_inv(work[col][col]);
        for x in 0..n {
            work[col][x] = gf_mul(work[col][x], inv_pivot);
            inverse[col][x] = gf_mul(inverse[col][x], inv_pivot);
        }
        for row in 0..n {
            if row == col || work[row][col] == 0 {
                continue;
            }
            let factor = work[row][col];
            for x in 0..n {
                work[row][x] ^= gf_mul(factor, work[col][x]);
                inverse[row][x] ^= gf_mul(factor, inverse[col][x]);
            }
        }
    }
    Ok(inverse)
}

impl Codec for RsCodec {
    fn width(&self) -> usize {
        self.k
    }

    fn parity_count(&self) -> usize {
        self.m
    }

    fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.k {
            return Err(FsError::Einval);
        }
        let len = data.iter().map(|d| d.len()).max().unwrap_or(0);
        let mut parities = vec![vec![0u8; len]; self.m];
        for (j, parity) in parities.iter_mut().enumerate() {
            for (i, block) in data.iter().enumerate() {
                mul_acc(parity, block, self.parity_rows[j][i]);
            }
        }
        Ok(parities)
    }

    fn reconstruct(&self, slots: &mut [Option<Vec<u8>>], block_size: usize) -> Result<()> {
        check_slot_count(slots, self.k + self.m)?;
        let missing: Vec<usize> = (0..slots.len()).filter(|i| slots[*i].is_none()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        if missing.len() > self.m {
            return Err(FsError::NoValidCopies);
        }

        // pick k available parts, preferring data parts (identity rows keep
        // the decode matrix sparse)
        let available: Vec<usize> =
            (0..slots.len()).filter(|i| slots[*i].is_some()).take(self.k).collect();
        if available.len() < self.k {
            return Err(FsError::NoValidCopies);
        }

        let decode_matrix: Vec<Vec<u8>> =
            available.iter().map(|&i| self.generator_row(i)).collect();
        let inverse = invert(&decode_matrix)?;

        // data_i = sum_j inverse[i][j] * available_j
        let mut recovered_data: Vec<Option<Vec<u8>>> = vec![None; self.k];
        for &target in missing.iter().filter(|&&i| i < self.k) {
            let mut block = vec![0u8; block_size];
            for (j, &src) in available.iter().enumerate() {
                if let Some(data) = &slots[src] {
                    mul_acc(&mut block, data, inverse[target][j]);
                }
            }
            recovered_data[target] = Some(block);
        }
        for (i, block) in recovered_data.into_iter().enumerate() {
            if let Some(block) = block {
                slots[i] = Some(block);
            }
        }

        // re-encode any missing parities from the now complete data set
        if missing.iter().any(|&i| i >= self.k) {
            let mut padded: Vec<Vec<u8>> = Vec::with_capacity(self.k);
            for slot in slots.iter().take(self.k) {
                let mut block = slot.clone().ok_or(FsError::NoValidCopies)?;
                block.resize(block_size, 0);
                padded.push(block);
            }
            let refs: Vec<&[u8]> = padded.iter().map(|b| b.as_slice()).collect();
            let parities = self.encode(&refs)?;
            for (j, parity) in parities.into_iter().enumerate() {
                if slots[self.k + j].is_none() {
                    slots[self.k + j] = Some(parity);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(k: usize, block_size: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..block_size).map(|b| ((i * 131 + b * 7) % 251) as u8).collect())
            .collect()
    }

    fn full_slots(codec: &RsCodec, data: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let parities = codec.encode(&refs).unwrap();
        data.iter().cloned().map(Some).chain(parities.into_iter().map(Some)).collect()
    }

    #[test]
    fn recovers_up_to_m_missing_parts() {
        let (k, m) = (4usize, 2usize);
        let codec = RsCodec::new(k as u8, m as u8);
        let data = sample_data(k, 48);
        let reference = full_slots(&codec, &data);

        // every pair of lost parts, data and parity alike
        for a in 0..k + m {
            for b in (a + 1)..k + m {
                let mut slots = reference.clone();
                slots[a] = None;
                slots[b] = None;
                codec.reconstruct(&mut slots, 48).unwrap();
                for i in 0..k + m {
                    assert_eq!(slots[i], reference[i], "lost ({}, {}), slot {}", a, b, i);
                }
            }
        }
    }

    #[test]
    fn too_many_missing_fails() {
        let codec = RsCodec::new(3, 1);
        let data = sample_data(3, 16);
        let mut slots = full_slots(&codec, &data);
        slots[0] = None;
        slots[2] = None;
        assert!(matches!(codec.reconstruct(&mut slots, 16), Err(FsError::NoValidCopies)));
    }

    #[test]
    fn cauchy_rows_have_no_zero_entries() {
        let codec = RsCodec::new(10, 4);
        for row in &codec.parity_rows {
            assert!(row.iter().all(|&c| c != 0));
        }
    }

    #[test]
    fn matrix_inversion_roundtrip() {
        let m = vec![vec![1u8, 2, 3], vec![4, 5, 6], vec![7, 8, 10]];
        let inv = invert(&m).unwrap();
        // m * inv == identity
        for i in 0..3 {
            for j in 0..3 {
                let mut acc = 0u8;
                for x in 0..3 {
                    acc ^= gf_mul(m[i][x], inv[x][j]);
                }
                assert_eq!(acc, (i == j) as u8);
            }
        }
    }
}
