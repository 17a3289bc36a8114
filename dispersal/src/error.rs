use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors surfaced by the dispersal codecs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid dispersal parameters: {0}")]
    InvalidParams(String),

    #[error("secret of {size} bytes exceeds the maximum of {max} bytes")]
    SecretTooLarge { size: usize, max: usize },

    #[error("share size {size} is not a multiple of the {word}-byte secret word")]
    UnalignedShare { size: usize, word: usize },

    #[error("the selected k rows of the distribution matrix are not invertible")]
    SingularMatrix,

    #[error("integrity check failed while reconstructing the secret")]
    Integrity,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
