use base58::ToBase58;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The size of a SHA-256 digest in bytes.
pub const CHECKSUM_SIZE: usize = 32;

/// A SHA-256 digest over stored bytes.
///
/// Medical documents carry the checksum of their sealed content so that a
/// read can detect tampering or corruption in the store before the blob is
/// handed to a caller.
///
/// # Examples
///
/// ```rust
/// use medvault_common::Checksum;
///
/// let checksum = Checksum::of(b"sealed bytes");
/// assert!(checksum.matches(b"sealed bytes"));
/// assert!(!checksum.matches(b"other bytes"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum([u8; CHECKSUM_SIZE]);

impl Checksum {
    /// Computes the checksum of the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Whether `bytes` hash to this checksum.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    /// The raw digest.
    pub fn bytes(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.0
    }
}

impl From<[u8; CHECKSUM_SIZE]> for Checksum {
    fn from(value: [u8; CHECKSUM_SIZE]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_base58())
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checksum(#{}...)", self.0[0..6].to_base58())
    }
}
