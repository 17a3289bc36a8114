//! Arithmetic in GF(2^8) with the reduction polynomial 0x11d, the field the
//! dispersal matrices operate in.
//!
//! Multiplication and division go through log/exp tables; the region variant
//! applies one coefficient to a whole buffer at a time, which is where
//! encoding and decoding spend almost all of their cycles.

use lazy_static::lazy_static;

/// x^8 + x^4 + x^3 + x^2 + 1, reduced to its low 8 bits during table build.
const POLY: u16 = 0x11d;

struct Tables {
    /// exp[i] = generator^i, doubled so `exp[log a + log b]` needs no modulo.
    exp: [u8; 510],
    /// log[a] for a != 0. log[0] is never read.
    log: [u16; 256],
}

lazy_static! {
    static ref TABLES: Tables = {
        let mut exp = [0u8; 510];
        let mut log = [0u16; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u16;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        for i in 255..510 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    };
}

/// Multiply two field elements.
#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[(t.log[a as usize] + t.log[b as usize]) as usize]
}

/// Divide `a` by `b`. `b` must be non-zero.
#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    assert!(b != 0, "division by zero in GF(256)");
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[(t.log[a as usize] + 255 - t.log[b as usize]) as usize]
}

/// Multiplicative inverse of a non-zero element.
#[inline]
pub fn inv(a: u8) -> u8 {
    div(1, a)
}

/// Multiply every byte of `src` by `coef` and either store the products into
/// `dst` or XOR-accumulate them onto it. `src` and `dst` must have equal
/// length.
///
/// A zero coefficient clears (or leaves) the destination and a coefficient of
/// one degenerates to a copy (or plain XOR), skipping the table lookups.
pub fn region_mul(src: &[u8], dst: &mut [u8], coef: u8, accumulate: bool) {
    assert_eq!(src.len(), dst.len());
    match coef {
        0 => {
            if !accumulate {
                dst.fill(0);
            }
        }
        1 => {
            if accumulate {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d ^= s;
                }
            } else {
                dst.copy_from_slice(src);
            }
        }
        _ => {
            // One row of the multiplication table, so the inner loop is a
            // single indexed load per byte.
            let mut row = [0u8; 256];
            for (i, r) in row.iter_mut().enumerate() {
                *r = mul(coef, i as u8);
            }
            if accumulate {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d ^= row[*s as usize];
                }
            } else {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = row[*s as usize];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_basics() {
        assert_eq!(mul(0, 123), 0);
        assert_eq!(mul(123, 0), 0);
        assert_eq!(mul(1, 123), 123);
        assert_eq!(mul(123, 1), 123);
        // commutativity over the full table
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                assert_eq!(mul(a, b), mul(b, a));
            }
        }
    }

    #[test]
    fn mul_div_inverse() {
        for a in 1..=255u8 {
            for b in 1..=255u8 {
                assert_eq!(div(mul(a, b), b), a);
            }
        }
    }

    #[test]
    fn inv_roundtrip() {
        for a in 1..=255u8 {
            assert_eq!(mul(a, inv(a)), 1);
        }
    }

    #[test]
    fn distributive() {
        for a in 0..=255u8 {
            assert_eq!(mul(a, 2) ^ mul(a, 3), mul(a, 2 ^ 3));
        }
    }

    #[test]
    fn region_mul_matches_scalar() {
        let src: Vec<u8> = (0..=255).collect();
        for coef in [0u8, 1, 2, 0x53, 0xff] {
            let mut dst = vec![0xaa; 256];
            region_mul(&src, &mut dst, coef, false);
            for (s, d) in src.iter().zip(&dst) {
                assert_eq!(*d, mul(coef, *s));
            }

            let mut acc = vec![0x11; 256];
            region_mul(&src, &mut acc, coef, true);
            for (s, d) in src.iter().zip(&acc) {
                assert_eq!(*d, 0x11 ^ mul(coef, *s));
            }
        }
    }
}
