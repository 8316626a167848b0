use serde::{Serialize, de::DeserializeOwned};

use crate::StoreError;

/// An [Encoder] converts records to and from the bytes a backend keeps
pub trait Encoder: Clone + Send + Sync + 'static {
    /// Encode a serializable record into bytes.
    fn encode<T>(&self, record: &T) -> Result<Vec<u8>, StoreError>
    where
        T: Serialize;

    /// Decode bytes into some deserializable record.
    fn decode<T>(&self, bytes: &[u8]) -> Result<T, StoreError>
    where
        T: DeserializeOwned;
}

/// A basic [`Encoder`] implementation that encodes records as DAG-CBOR
#[derive(Clone, Copy, Debug, Default)]
pub struct CborEncoder;

impl Encoder for CborEncoder {
    fn encode<T>(&self, record: &T) -> Result<Vec<u8>, StoreError>
    where
        T: Serialize,
    {
        serde_ipld_dagcbor::to_vec(record)
            .map_err(|error| StoreError::EncodeFailed(format!("{error}")))
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        serde_ipld_dagcbor::from_slice::<T>(bytes)
            .map_err(|error| StoreError::DecodeFailed(format!("{error}")))
    }
}
