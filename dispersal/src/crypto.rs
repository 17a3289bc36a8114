//! Hashing and deterministic block encryption used by the codecs.
//!
//! Encryption is AES-CBC with padding disabled and an all-zero IV: the
//! ciphertext has exactly the length of the plaintext and is a pure function
//! of (plaintext, key). That determinism is what makes the convergent AONT
//! variants produce identical shares for identical chunks.

use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Fingerprint;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// AES block size, shared by both cipher strengths.
pub const BLOCK_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("input of {len} bytes is not a multiple of the {block}-byte cipher block")]
    UnalignedInput { len: usize, block: usize },

    #[error("key of {len} bytes does not match the expected {expected} bytes")]
    BadKeyLength { len: usize, expected: usize },

    #[error("suite {0:?} provides no cipher")]
    NoCipher(CryptoSuite),
}

/// Pairings of hash and cipher.
///
/// `High` and `Low` are the keyed suites the codecs run on; `Sha256` and
/// `Sha1` are hash-only instances used for fingerprinting and benchmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoSuite {
    /// SHA-256 + AES-256-CBC.
    High,
    /// MD5 + AES-128-CBC.
    Low,
    /// Hash-only SHA-256.
    Sha256,
    /// Hash-only SHA-1.
    Sha1,
}

/// A hash/encrypt provider. Instances are cheap and carry no shared state,
/// so every worker task owns one.
#[derive(Debug, Clone)]
pub struct CryptoPrimitive {
    suite: CryptoSuite,
}

impl CryptoPrimitive {
    pub fn new(suite: CryptoSuite) -> Self {
        CryptoPrimitive { suite }
    }

    pub fn suite(&self) -> CryptoSuite {
        self.suite
    }

    pub fn hash_size(&self) -> usize {
        match self.suite {
            CryptoSuite::High | CryptoSuite::Sha256 => 32,
            CryptoSuite::Sha1 => 20,
            CryptoSuite::Low => 16,
        }
    }

    pub fn key_size(&self) -> Option<usize> {
        match self.suite {
            CryptoSuite::High => Some(32),
            CryptoSuite::Low => Some(16),
            CryptoSuite::Sha256 | CryptoSuite::Sha1 => None,
        }
    }

    pub fn block_size(&self) -> Option<usize> {
        match self.suite {
            CryptoSuite::High | CryptoSuite::Low => Some(BLOCK_SIZE),
            CryptoSuite::Sha256 | CryptoSuite::Sha1 => None,
        }
    }

    /// Hash `data` with the suite's digest; the output has `hash_size()`
    /// bytes.
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self.suite {
            CryptoSuite::High | CryptoSuite::Sha256 => Sha256::digest(data).to_vec(),
            CryptoSuite::Sha1 => Sha1::digest(data).to_vec(),
            CryptoSuite::Low => Md5::digest(data).to_vec(),
        }
    }

    /// Encrypt `data` with the suite's cipher, no padding, zero IV. The
    /// input length must be a multiple of [BLOCK_SIZE]; the output has
    /// exactly the input length.
    pub fn encrypt_no_pad(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key_size = self.key_size().ok_or(CryptoError::NoCipher(self.suite))?;
        if key.len() != key_size {
            return Err(CryptoError::BadKeyLength {
                len: key.len(),
                expected: key_size,
            });
        }
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedInput {
                len: data.len(),
                block: BLOCK_SIZE,
            });
        }

        let iv = [0u8; BLOCK_SIZE];
        let ciphertext = match self.suite {
            CryptoSuite::High => Aes256CbcEnc::new_from_slices(key, &iv)
                .expect("key and iv lengths checked above")
                .encrypt_padded_vec_mut::<NoPadding>(data),
            CryptoSuite::Low => Aes128CbcEnc::new_from_slices(key, &iv)
                .expect("key and iv lengths checked above")
                .encrypt_padded_vec_mut::<NoPadding>(data),
            _ => unreachable!("key_size() returned Some for a hash-only suite"),
        };
        debug_assert_eq!(ciphertext.len(), data.len());
        Ok(ciphertext)
    }
}

/// The SHA-256 fingerprint of a share body (or any other identity input).
/// Fingerprints are fixed to SHA-256 independently of the codec suite, since
/// the server's indexes are keyed by them.
pub fn sha256_fingerprint(data: &[u8]) -> Fingerprint {
    let digest: [u8; 32] = Sha256::digest(data).into();
    Fingerprint::from(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_known_vector() {
        let c = CryptoPrimitive::new(CryptoSuite::High);
        assert_eq!(
            c.hash(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn md5_known_vector() {
        let c = CryptoPrimitive::new(CryptoSuite::Low);
        assert_eq!(c.hash(b"abc"), hex!("900150983cd24fb0d6963f7d28e17f72"));
    }

    #[test]
    fn sha1_known_vector() {
        let c = CryptoPrimitive::new(CryptoSuite::Sha1);
        assert_eq!(c.hash(b"abc"), hex!("a9993e364706816aba3e25717850c26c9cd0d89d"));
    }

    #[test]
    fn aes256_zero_iv_first_block() {
        // With a zero IV the first CBC block equals plain AES of the block.
        let c = CryptoPrimitive::new(CryptoSuite::High);
        let ct = c.encrypt_no_pad(&[0u8; 16], &[0u8; 32]).unwrap();
        assert_eq!(ct, hex!("dc95c078a2408989ad48a21492842087"));
    }

    #[test]
    fn aes128_zero_iv_first_block() {
        let c = CryptoPrimitive::new(CryptoSuite::Low);
        let ct = c.encrypt_no_pad(&[0u8; 16], &[0u8; 16]).unwrap();
        assert_eq!(ct, hex!("66e94bd4ef8a2c3b884cfa59ca342b2e"));
    }

    #[test]
    fn ciphertext_length_matches_plaintext() {
        let c = CryptoPrimitive::new(CryptoSuite::High);
        let key = [7u8; 32];
        for blocks in [1usize, 2, 17] {
            let pt = vec![0x5a; blocks * BLOCK_SIZE];
            assert_eq!(c.encrypt_no_pad(&pt, &key).unwrap().len(), pt.len());
        }
    }

    #[test]
    fn unaligned_input_is_rejected() {
        let c = CryptoPrimitive::new(CryptoSuite::High);
        assert!(matches!(
            c.encrypt_no_pad(&[0u8; 15], &[0u8; 32]),
            Err(CryptoError::UnalignedInput { .. })
        ));
    }

    #[test]
    fn encryption_is_deterministic() {
        let c = CryptoPrimitive::new(CryptoSuite::High);
        let key = [3u8; 32];
        let pt = vec![0x42; 64];
        assert_eq!(
            c.encrypt_no_pad(&pt, &key).unwrap(),
            c.encrypt_no_pad(&pt, &key).unwrap()
        );
    }

    #[test]
    fn hash_only_suite_has_no_cipher() {
        let c = CryptoPrimitive::new(CryptoSuite::Sha256);
        assert_eq!(c.key_size(), None);
        assert!(matches!(
            c.encrypt_no_pad(&[0u8; 16], &[0u8; 32]),
            Err(CryptoError::NoCipher(_))
        ));
    }
}
