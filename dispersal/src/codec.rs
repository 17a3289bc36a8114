//! The convergent dispersal codecs: encode a secret (one chunk of plaintext)
//! into `n` shares such that any `k = n - m` of them reconstruct it and any
//! `r < k` reveal nothing, while identical secrets produce identical shares.
//!
//! Four variants share one interface:
//!
//! - `Crsss`: each group of `k - r` secret words is extended with `r` keyed
//!   hashes of the group, then dispersed with a Cauchy information-dispersal
//!   matrix.
//! - `AontRs`: an all-or-nothing transform under a fresh random key,
//!   followed by systematic Reed-Solomon parity. Not convergent.
//! - `OldCaontRs`: AONT-RS with the random key replaced by the hash of the
//!   secret, making it convergent.
//! - `CaontRs`: the primary convergent variant; the AONT keystream is one
//!   encryption of a constant block instead of per-word encryptions.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::CryptoPrimitive;
use crate::gf256;
use crate::matrix::Matrix;
use crate::CodecError;

/// Largest secret a codec accepts; chunkers are configured well below this.
pub const MAX_SECRET_SIZE: usize = 64 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Crsss,
    AontRs,
    OldCaontRs,
    CaontRs,
}

/// A dispersal codec for a fixed `(variant, n, m, r)` and crypto suite.
///
/// Holds per-instance scratch buffers, so encoding and decoding take `&mut
/// self`; give each worker its own instance.
pub struct Codec {
    variant: Variant,
    n: usize,
    m: usize,
    k: usize,
    r: usize,
    /// Bytes per secret word, equal to the suite's hash size.
    word: usize,
    crypto: CryptoPrimitive,
    /// `n x k` (ramp) or `(k + m) x k` (systematic) distribution matrix.
    dist: Matrix,
    aligned: Vec<u8>,
    package: Vec<u8>,
    /// The fixed block `constant[i] = i & 0xff`, used by `CaontRs`.
    constant: Vec<u8>,
}

impl Codec {
    pub fn new(
        variant: Variant,
        n: usize,
        m: usize,
        r: usize,
        crypto: CryptoPrimitive,
    ) -> Result<Self, CodecError> {
        if m == 0 || m >= n {
            return Err(CodecError::InvalidParams(format!(
                "m must be in (0, n); got n={}, m={}",
                n, m
            )));
        }
        let k = n - m;
        if k <= 1 {
            return Err(CodecError::InvalidParams(format!(
                "k = n - m must be > 1 to provide confidentiality; got k={}",
                k
            )));
        }
        if r == 0 || r >= k {
            return Err(CodecError::InvalidParams(format!(
                "r must be in (0, k); got k={}, r={}",
                k, r
            )));
        }

        let word = crypto.hash_size();
        let dist = match variant {
            Variant::Crsss => Matrix::cauchy_ramp(n, k),
            Variant::AontRs | Variant::OldCaontRs | Variant::CaontRs => {
                if r != k - 1 {
                    return Err(CodecError::InvalidParams(format!(
                        "the AONT variants require r = k - 1; got k={}, r={}",
                        k, r
                    )));
                }
                match crypto.key_size() {
                    Some(key_size) if key_size == word => {}
                    Some(key_size) => {
                        return Err(CodecError::InvalidParams(format!(
                            "hash size {} and key size {} must match for the AONT variants",
                            word, key_size
                        )))
                    }
                    None => {
                        return Err(CodecError::InvalidParams(
                            "the AONT variants need a suite with a cipher".into(),
                        ))
                    }
                }
                Matrix::cauchy_systematic(k, m)
            }
        };

        let constant = if variant == Variant::CaontRs {
            (0..MAX_SECRET_SIZE + word * k).map(|i| i as u8).collect()
        } else {
            Vec::new()
        };

        Ok(Codec {
            variant,
            n,
            m,
            k,
            r,
            word,
            crypto,
            dist,
            aligned: Vec::new(),
            package: Vec::new(),
            constant,
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// The share size produced for a secret of `secret_size` bytes; a pure
    /// function of the parameters.
    pub fn share_size(&self, secret_size: usize) -> usize {
        match self.variant {
            Variant::Crsss => {
                let group = self.word * (self.k - self.r);
                self.word * (align_up(secret_size, group) / group)
            }
            _ => {
                let aligned = self.aont_aligned_size(secret_size);
                self.word * ((aligned / self.word + 1) / self.k)
            }
        }
    }

    /// Encode `secret` into `n` shares of equal size.
    pub fn encode(&mut self, secret: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        if secret.len() > MAX_SECRET_SIZE {
            return Err(CodecError::SecretTooLarge {
                size: secret.len(),
                max: MAX_SECRET_SIZE,
            });
        }
        match self.variant {
            Variant::Crsss => self.crsss_encode(secret),
            _ => self.aont_encode(secret),
        }
    }

    /// Reconstruct a secret of `secret_size` bytes from `k` shares. `ids[i]`
    /// is the share index (row of the distribution matrix) of `shares[i]`.
    pub fn decode(
        &mut self,
        shares: &[Vec<u8>],
        ids: &[usize],
        secret_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        if shares.len() != self.k || ids.len() != self.k {
            return Err(CodecError::InvalidParams(format!(
                "decoding needs exactly k = {} shares, got {}",
                self.k,
                shares.len()
            )));
        }
        if ids.iter().any(|&id| id >= self.n) {
            return Err(CodecError::InvalidParams(format!(
                "share IDs must be below n = {}",
                self.n
            )));
        }
        let share_size = shares[0].len();
        if shares.iter().any(|s| s.len() != share_size) {
            return Err(CodecError::InvalidParams(
                "shares must all have the same size".into(),
            ));
        }
        if share_size % self.word != 0 {
            return Err(CodecError::UnalignedShare {
                size: share_size,
                word: self.word,
            });
        }
        match self.variant {
            Variant::Crsss => self.crsss_decode(shares, ids, share_size, secret_size),
            _ => self.aont_decode(shares, ids, share_size, secret_size),
        }
    }

    fn crsss_encode(&mut self, secret: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let group = self.word * (self.k - self.r);
        let aligned_len = align_up(secret.len(), group);
        let share_size = self.word * (aligned_len / group);
        let groups = aligned_len / group;

        self.aligned.clear();
        self.aligned.extend_from_slice(secret);
        self.aligned.resize(aligned_len, 0);

        self.package.clear();
        self.package.resize(share_size * self.k, 0);

        // Lay out the stripe: rows 0..k-r carry the secret words of each
        // group, rows k-r..k carry the r keyed group hashes.
        let mut hash_input = vec![0u8; group + 1];
        for g in 0..groups {
            let gbytes = &self.aligned[g * group..(g + 1) * group];
            for j in 0..self.k - self.r {
                let off = j * share_size + g * self.word;
                self.package[off..off + self.word]
                    .copy_from_slice(&gbytes[j * self.word..(j + 1) * self.word]);
            }
            hash_input[..group].copy_from_slice(gbytes);
            for j in 0..self.r {
                // A distinct trailing seed byte stands in for a distinct
                // hash function per row.
                hash_input[group] = j as u8;
                let h = self.crypto.hash(&hash_input);
                let off = (self.k - self.r + j) * share_size + g * self.word;
                self.package[off..off + self.word].copy_from_slice(&h[..self.word]);
            }
        }

        Ok(self.disperse_all_rows(share_size))
    }

    fn crsss_decode(
        &mut self,
        shares: &[Vec<u8>],
        ids: &[usize],
        share_size: usize,
        secret_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let group = self.word * (self.k - self.r);
        let groups = share_size / self.word;
        let aligned_len = group * groups;
        if secret_size > aligned_len {
            return Err(CodecError::SecretTooLarge {
                size: secret_size,
                max: aligned_len,
            });
        }

        self.recover_package(shares, ids, share_size)?;

        self.aligned.clear();
        self.aligned.resize(aligned_len, 0);
        let mut hash_input = vec![0u8; group + 1];
        for g in 0..groups {
            for j in 0..self.k - self.r {
                let off = j * share_size + g * self.word;
                self.aligned[g * group + j * self.word..g * group + (j + 1) * self.word]
                    .copy_from_slice(&self.package[off..off + self.word]);
            }
            hash_input[..group].copy_from_slice(&self.aligned[g * group..(g + 1) * group]);
            for j in 0..self.r {
                hash_input[group] = j as u8;
                let h = self.crypto.hash(&hash_input);
                let off = (self.k - self.r + j) * share_size + g * self.word;
                if self.package[off..off + self.word] != h[..self.word] {
                    return Err(CodecError::Integrity);
                }
            }
        }

        Ok(self.aligned[..secret_size].to_vec())
    }

    fn aont_encode(&mut self, secret: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let aligned_len = self.aont_aligned_size(secret.len());
        let num_words = aligned_len / self.word;
        let share_size = self.word * ((num_words + 1) / self.k);

        self.aligned.clear();
        self.aligned.extend_from_slice(secret);
        self.aligned.resize(aligned_len, 0);

        let key = match self.variant {
            Variant::AontRs => {
                let mut key = vec![0u8; self.word];
                OsRng.fill_bytes(&mut key);
                key
            }
            _ => self.crypto.hash(&self.aligned),
        };

        self.package.clear();
        self.package.resize(aligned_len + self.word, 0);

        // Main part: aligned secret XOR keystream.
        match self.variant {
            Variant::CaontRs => {
                let ct = self
                    .crypto
                    .encrypt_no_pad(&self.constant[..aligned_len], &key)?;
                self.package[..aligned_len].copy_from_slice(&ct);
                gf256::region_mul(&self.aligned, &mut self.package[..aligned_len], 1, true);
            }
            _ => {
                for i in 0..num_words {
                    let ct = self.crypto.encrypt_no_pad(&index_word(i, self.word), &key)?;
                    let off = i * self.word;
                    self.package[off..off + self.word].copy_from_slice(&ct);
                    gf256::region_mul(
                        &self.aligned[off..off + self.word],
                        &mut self.package[off..off + self.word],
                        1,
                        true,
                    );
                }
            }
        }

        // Tail word: hash of the main part XOR the key. Without all main
        // words the key is unrecoverable, which is the all-or-nothing
        // property.
        let h = self.crypto.hash(&self.package[..aligned_len]);
        for (i, b) in self.package[aligned_len..].iter_mut().enumerate() {
            *b = h[i] ^ key[i];
        }

        // The package is the first k shares verbatim; the last m shares are
        // the Cauchy parity rows.
        let mut shares = Vec::with_capacity(self.n);
        for row in 0..self.k {
            shares.push(self.package[row * share_size..(row + 1) * share_size].to_vec());
        }
        for i in 0..self.m {
            let mut parity = vec![0u8; share_size];
            for j in 0..self.k {
                let coef = self.dist.get(self.k + i, j);
                gf256::region_mul(
                    &self.package[j * share_size..(j + 1) * share_size],
                    &mut parity,
                    coef,
                    j != 0,
                );
            }
            shares.push(parity);
        }
        Ok(shares)
    }

    fn aont_decode(
        &mut self,
        shares: &[Vec<u8>],
        ids: &[usize],
        share_size: usize,
        secret_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        if share_size == 0 {
            return Err(CodecError::UnalignedShare {
                size: share_size,
                word: self.word,
            });
        }
        let aligned_len = share_size * self.k - self.word;
        let num_words = aligned_len / self.word;
        if secret_size > aligned_len {
            return Err(CodecError::SecretTooLarge {
                size: secret_size,
                max: aligned_len,
            });
        }

        self.recover_package(shares, ids, share_size)?;

        // key = H(main part) XOR tail word.
        let mut key = self.crypto.hash(&self.package[..aligned_len]);
        for (i, b) in key.iter_mut().enumerate() {
            *b ^= self.package[aligned_len + i];
        }

        self.aligned.clear();
        self.aligned.resize(aligned_len, 0);
        match self.variant {
            Variant::CaontRs => {
                let ct = self
                    .crypto
                    .encrypt_no_pad(&self.constant[..aligned_len], &key)?;
                self.aligned.copy_from_slice(&ct);
                gf256::region_mul(
                    &self.package[..aligned_len],
                    &mut self.aligned[..],
                    1,
                    true,
                );
            }
            _ => {
                for i in 0..num_words {
                    let ct = self.crypto.encrypt_no_pad(&index_word(i, self.word), &key)?;
                    let off = i * self.word;
                    self.aligned[off..off + self.word].copy_from_slice(&ct);
                    gf256::region_mul(
                        &self.package[off..off + self.word],
                        &mut self.aligned[off..off + self.word],
                        1,
                        true,
                    );
                }
            }
        }

        // The convergent variants re-derive the key from the recovered
        // secret and must find it unchanged.
        if matches!(self.variant, Variant::OldCaontRs | Variant::CaontRs)
            && self.crypto.hash(&self.aligned) != key
        {
            return Err(CodecError::Integrity);
        }

        Ok(self.aligned[..secret_size].to_vec())
    }

    /// Multiply every row of the distribution matrix with the stripe in
    /// `self.package`, yielding all n shares. CRSSS path.
    fn disperse_all_rows(&self, share_size: usize) -> Vec<Vec<u8>> {
        let mut shares = vec![vec![0u8; share_size]; self.n];
        for (i, share) in shares.iter_mut().enumerate() {
            for j in 0..self.k {
                let coef = self.dist.get(i, j);
                gf256::region_mul(
                    &self.package[j * share_size..(j + 1) * share_size],
                    share,
                    coef,
                    j != 0,
                );
            }
        }
        shares
    }

    /// Invert the k selected distribution rows and apply the inverse to the
    /// received shares, leaving the recovered stripe in `self.package`.
    fn recover_package(
        &mut self,
        shares: &[Vec<u8>],
        ids: &[usize],
        share_size: usize,
    ) -> Result<(), CodecError> {
        let square = self.dist.select_rows(ids);
        let inverse = square.invert()?;

        self.package.clear();
        self.package.resize(share_size * self.k, 0);
        for i in 0..self.k {
            for (j, share) in shares.iter().enumerate() {
                let coef = inverse.get(i, j);
                gf256::region_mul(
                    share,
                    &mut self.package[i * share_size..(i + 1) * share_size],
                    coef,
                    j != 0,
                );
            }
        }
        Ok(())
    }

    /// Alignment of the AONT family: the aligned secret plus the tail word
    /// must fill the k package rows exactly.
    fn aont_aligned_size(&self, secret_size: usize) -> usize {
        let wk = self.word * self.k;
        if (secret_size + self.word) % wk == 0 {
            secret_size
        } else {
            wk * ((secret_size + self.word) / wk + 1) - self.word
        }
    }
}

/// A secret word holding the little-endian word index, used as the AONT
/// "counter" plaintext.
fn index_word(i: usize, word: usize) -> Vec<u8> {
    let mut buf = vec![0u8; word];
    buf[..4].copy_from_slice(&(i as u32).to_le_bytes());
    buf
}

fn align_up(v: usize, to: usize) -> usize {
    v.div_ceil(to) * to
}
