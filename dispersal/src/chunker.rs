//! Splitting an input buffer into chunks, either at fixed offsets or at
//! content-defined anchors found with a Rabin rolling hash.
//!
//! The rolling fingerprint over a `win`-byte window is
//! `fp = sum(buf[end - i] * B^i) mod M` with `B = 257` and `M = 2^23`; a
//! chunk ends where `fp & (avg - 1) == 0`, clamped to `[min, max]` bytes.
//! The two lookup tables turn the per-byte update into one add, one table
//! load and one multiply.

use thiserror::Error;

/// Base of the rolling polynomial, a prime larger than any byte value.
const POLY_BASE: u32 = 257;
/// Modulus of the rolling polynomial; a power of two so `mod` is an AND.
const POLY_MOD: u32 = 1 << 23;
/// Fingerprint value that marks a chunk boundary.
const ANCHOR_VALUE: u32 = 0;

#[derive(Error, Debug, PartialEq)]
pub enum ChunkerError {
    #[error("invalid chunker parameters: {0}")]
    InvalidParams(String),
}

enum Strategy {
    Fixed {
        avg: usize,
    },
    Rabin {
        min: usize,
        max: usize,
        win: usize,
        /// pow[i] = B^i mod M
        pow: Vec<u32>,
        /// remove[b] = (-b * B^(win-1)) mod M
        remove: [u32; 256],
        /// avg - 1; requires avg to be a power of two.
        mask: u32,
    },
}

pub struct Chunker {
    strategy: Strategy,
}

impl Chunker {
    /// A chunker that cuts every `avg` bytes.
    pub fn fixed(avg: usize) -> Result<Self, ChunkerError> {
        if avg == 0 {
            return Err(ChunkerError::InvalidParams("avg must be non-zero".into()));
        }
        Ok(Chunker {
            strategy: Strategy::Fixed { avg },
        })
    }

    /// A content-defined chunker with average/minimum/maximum chunk sizes
    /// and a `win`-byte rolling window.
    pub fn rabin(avg: usize, min: usize, max: usize, win: usize) -> Result<Self, ChunkerError> {
        if !avg.is_power_of_two() {
            return Err(ChunkerError::InvalidParams(format!(
                "avg chunk size {} is not a power of two",
                avg
            )));
        }
        if min >= avg {
            return Err(ChunkerError::InvalidParams(format!(
                "min chunk size {} must be smaller than avg {}",
                min, avg
            )));
        }
        if max <= avg {
            return Err(ChunkerError::InvalidParams(format!(
                "max chunk size {} must be larger than avg {}",
                max, avg
            )));
        }
        if win == 0 || win > min {
            return Err(ChunkerError::InvalidParams(format!(
                "window size {} must be in 1..={}",
                win, min
            )));
        }

        let mut pow = vec![0u32; win];
        pow[0] = 1;
        for i in 1..win {
            pow[i] = pow[i - 1].wrapping_mul(POLY_BASE) & (POLY_MOD - 1);
        }

        let mut remove = [0u32; 256];
        for (b, r) in remove.iter_mut().enumerate() {
            let v = (b as u32).wrapping_mul(pow[win - 1]) & (POLY_MOD - 1);
            *r = if v == 0 { 0 } else { POLY_MOD - v };
        }

        Ok(Chunker {
            strategy: Strategy::Rabin {
                min,
                max,
                win,
                pow,
                remove,
                mask: (avg - 1) as u32,
            },
        })
    }

    /// The inclusive end index of every chunk in `buf`, in order. The final
    /// chunk may be shorter than the minimum; all others satisfy the
    /// configured bounds.
    pub fn chunk_ends(&self, buf: &[u8]) -> Vec<usize> {
        if buf.is_empty() {
            return Vec::new();
        }
        match &self.strategy {
            Strategy::Fixed { avg } => Self::fixed_ends(buf.len(), *avg),
            Strategy::Rabin {
                min,
                max,
                win,
                pow,
                remove,
                mask,
            } => Self::rabin_ends(buf, *min, *max, *win, pow, remove, *mask),
        }
    }

    fn fixed_ends(len: usize, avg: usize) -> Vec<usize> {
        let mut ends = Vec::with_capacity(len / avg + 1);
        let mut end = avg - 1;
        while end < len {
            ends.push(end);
            end += avg;
        }
        if ends.last() != Some(&(len - 1)) {
            ends.push(len - 1);
        }
        ends
    }

    fn rabin_ends(
        buf: &[u8],
        min: usize,
        max: usize,
        win: usize,
        pow: &[u32],
        remove: &[u32; 256],
        mask: u32,
    ) -> Vec<usize> {
        let len = buf.len();
        let mut ends = Vec::with_capacity(len / min + 1);
        let mut end = min - 1;
        let mut limit = max - 1;

        while end < len {
            let cap = limit.min(len - 1);

            // Fingerprint of the first window of this chunk.
            let mut fp: u32 = 0;
            for i in 0..win {
                fp = fp.wrapping_add((buf[end - i] as u32).wrapping_mul(pow[i]) & (POLY_MOD - 1));
            }
            fp &= POLY_MOD - 1;

            // Slide until the anchor fires or the chunk hits its size cap.
            while (fp & mask) != ANCHOR_VALUE && end < cap {
                end += 1;
                fp = fp
                    .wrapping_add(remove[buf[end - win] as usize])
                    .wrapping_mul(POLY_BASE)
                    .wrapping_add(buf[end] as u32)
                    & (POLY_MOD - 1);
            }

            ends.push(end);
            limit = end + max;
            end += min;
        }

        if ends.last() != Some(&(len - 1)) {
            ends.push(len - 1);
        }
        ends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(ends: &[usize]) -> Vec<usize> {
        let mut prev: isize = -1;
        ends.iter()
            .map(|&e| {
                let s = (e as isize - prev) as usize;
                prev = e as isize;
                s
            })
            .collect()
    }

    /// Pseudo-random but deterministic test data.
    fn test_data(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491u64;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn fixed_chunking_cuts_every_avg_bytes() {
        let chunker = Chunker::fixed(8).unwrap();
        assert_eq!(chunker.chunk_ends(&[0u8; 24]), vec![7, 15, 23]);
        // short tail
        assert_eq!(chunker.chunk_ends(&[0u8; 20]), vec![7, 15, 19]);
        // input shorter than one chunk
        assert_eq!(chunker.chunk_ends(&[0u8; 3]), vec![2]);
    }

    #[test]
    fn zeros_anchor_at_every_min_boundary() {
        // On an all-zero buffer the window fingerprint stays zero, so the
        // anchor fires immediately at each minimum boundary.
        let chunker = Chunker::rabin(8, 4, 16, 4).unwrap();
        let ends = chunker.chunk_ends(&[0u8; 64]);
        assert_eq!(ends[0], 3);
        assert_eq!(ends, vec![3, 7, 11, 15, 19, 23, 27, 31, 35, 39, 43, 47, 51, 55, 59, 63]);
        assert_eq!(*ends.last().unwrap(), 63);
    }

    #[test]
    fn bounds_hold_for_all_but_the_tail() {
        let chunker = Chunker::rabin(64, 16, 256, 8).unwrap();
        let data = test_data(16 * 1024);
        let ends = chunker.chunk_ends(&data);
        let sizes = sizes(&ends);
        for (i, &s) in sizes.iter().enumerate() {
            if i + 1 < sizes.len() {
                assert!((16..=256).contains(&s), "chunk {} has size {}", i, s);
            } else {
                assert!(s <= 256);
            }
        }
        assert_eq!(sizes.iter().sum::<usize>(), data.len());
    }

    #[test]
    fn chunking_is_deterministic() {
        let chunker = Chunker::rabin(64, 16, 256, 8).unwrap();
        let data = test_data(8 * 1024);
        assert_eq!(chunker.chunk_ends(&data), chunker.chunk_ends(&data));
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunker = Chunker::rabin(8, 4, 16, 4).unwrap();
        assert!(chunker.chunk_ends(&[]).is_empty());
    }

    #[test]
    fn parameter_validation() {
        assert!(Chunker::rabin(100, 4, 200, 4).is_err()); // avg not a power of two
        assert!(Chunker::rabin(8, 8, 16, 4).is_err()); // min not < avg
        assert!(Chunker::rabin(8, 4, 8, 4).is_err()); // max not > avg
        assert!(Chunker::rabin(8, 4, 16, 6).is_err()); // window larger than min
        assert!(Chunker::fixed(0).is_err());
    }
}
