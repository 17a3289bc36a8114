//! Core algorithms of the cirrus dispersal store: content-defined chunking,
//! GF(2^8) arithmetic, and the convergent dispersal codecs that turn a chunk
//! into `n` shares of which any `k = n - m` reconstruct it while any `r < k`
//! reveal nothing.

pub mod chunker;
pub mod codec;
pub mod crypto;
pub mod gf256;
pub mod matrix;

mod error;
mod fingerprint;

pub use error::CodecError;
pub use fingerprint::{Fingerprint, FINGERPRINT_LEN};
