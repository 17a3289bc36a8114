use data_encoding::HEXLOWER;
use thiserror::Error;

/// Length of a share or inode fingerprint: SHA-256 regardless of the codec's
/// crypto suite, because the server indexes are keyed by these.
pub const FINGERPRINT_LEN: usize = 32;

/// A SHA-256 fingerprint of a share body or an inode identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("invalid fingerprint length: {0}")]
    InvalidLength(usize),
}

impl Fingerprint {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; FINGERPRINT_LEN] {
        self.0
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(value: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(value)
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; FINGERPRINT_LEN] = value
            .try_into()
            .map_err(|_| FingerprintError::InvalidLength(value.len()))?;
        Ok(Fingerprint(arr))
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_checks_length() {
        assert!(Fingerprint::try_from([0u8; 31].as_slice()).is_err());
        assert!(Fingerprint::try_from([0u8; 32].as_slice()).is_ok());
    }

    #[test]
    fn display_is_lower_hex() {
        let fp = Fingerprint::from([0xabu8; 32]);
        assert_eq!(format!("{}", fp), "ab".repeat(32));
    }
}
