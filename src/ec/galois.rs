//! GF(2^8) arithmetic over the polynomial x^8 + x^4 + x^3 + x^2 + 1.
//!
//! Multiplication and division go through log/exp lookup tables built once
//! at first use. The generator is 2.

use once_cell::sync::Lazy;

const POLY: u16 = 0x1d;

pub struct GfTables {
    pub log: [u8; 256],
    pub exp: [u8; 512],
}

static TABLES: Lazy<GfTables> = Lazy::new(|| {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    for i in 0..255u16 {
        exp[i as usize] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLY | 0x100;
        }
    }
    // mirror so that exp[log a + log b] never needs a modulo
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    GfTables { log, exp }
});

#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

#[inline]
pub fn gf_inv(a: u8) -> u8 {
    debug_assert!(a != 0);
    let t = &*TABLES;
    t.exp[255 - t.log[a as usize] as usize]
}

#[inline]
pub fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0);
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + 255 - t.log[b as usize] as usize]
}

/// `dest[i] ^= coeff * src[i]` over the common prefix.
pub fn mul_acc(dest: &mut [u8], src: &[u8], coeff: u8) {
    if coeff == 0 {
        return;
    }
    let n = dest.len().min(src.len());
    if coeff == 1 {
        for i in 0..n {
            dest[i] ^= src[i];
        }
        return;
    }
    let t = &*TABLES;
    let log_c = t.log[coeff as usize] as usize;
    for i in 0..n {
        let s = src[i];
        if s != 0 {
            dest[i] ^= t.exp[log_c + t.log[s as usize] as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_axioms_hold() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a = {}", a);
            assert_eq!(gf_mul(a, 1), a);
            assert_eq!(gf_mul(a, 0), 0);
        }
        for a in 0..=255u8 {
            for b in 1..=255u8 {
                assert_eq!(gf_mul(gf_div(a, b), b), a);
            }
        }
    }

    #[test]
    fn multiplication_distributes() {
        for &(a, b, c) in &[(3u8, 7u8, 9u8), (0x53, 0xca, 0x01), (255, 254, 253)] {
            assert_eq!(gf_mul(a, b ^ c), gf_mul(a, b) ^ gf_mul(a, c));
            assert_eq!(gf_mul(a, gf_mul(b, c)), gf_mul(gf_mul(a, b), c));
        }
    }

    #[test]
    fn mul_acc_matches_scalar() {
        let src = [1u8, 2, 3, 0xff, 0];
        let mut dest = [9u8, 8, 7, 6, 5];
        let expected: Vec<u8> =
            dest.iter().zip(src.iter()).map(|(d, s)| d ^ gf_mul(0x1b, *s)).collect();
        mul_acc(&mut dest, &src, 0x1b);
        assert_eq!(dest.to_vec(), expected);
    }
}
