use thiserror::Error;

use crate::Edition;

/// The common error type used by this crate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An error that occurs while encoding a record
    #[error("Failed to encode a record: {0}")]
    EncodeFailed(String),

    /// An error that occurs while decoding a record
    #[error("Failed to decode a record: {0}")]
    DecodeFailed(String),

    /// The backing substrate failed
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A record with the same id is already stored
    #[error("Record {id} already exists in {collection}")]
    DuplicateId {
        /// Collection written to
        collection: &'static str,
        /// Offending id
        id: String,
    },

    /// Another record already holds one of the unique keys of the record
    #[error("Unique key '{key}' is already held in {collection}")]
    UniqueViolation {
        /// Collection written to
        collection: &'static str,
        /// The contested unique key
        key: String,
    },

    /// A compare-and-swap found a different edition than expected
    #[error("Record {id} in {collection} is at edition {found}, expected {expected}")]
    EditionMismatch {
        /// Collection written to
        collection: &'static str,
        /// Record id
        id: String,
        /// Edition the writer read
        expected: Edition,
        /// Edition currently stored
        found: Edition,
    },

    /// The record to replace does not exist
    #[error("Record {id} not found in {collection}")]
    Missing {
        /// Collection written to
        collection: &'static str,
        /// Record id
        id: String,
    },
}
