use serde::{Serialize, de::DeserializeOwned};

/// Monotonic version of a stored record, bumped on every successful write.
///
/// Writers hand back the edition they read so that the store can reject a
/// write racing with another one (compare-and-swap).
pub type Edition = u64;

/// An entity that can be kept in a [`crate::DocumentStore`].
pub trait Record:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Name of the collection the record lives in.
    const COLLECTION: &'static str;

    /// Stable identifier of the record within its collection.
    fn id(&self) -> String;

    /// Keys that no two records of the collection may hold at the same time.
    ///
    /// The set is re-evaluated on every write, so a key may depend on record
    /// state (a key that only exists while the record is active is released
    /// when the record is deactivated).
    fn unique_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A record together with the edition it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<R> {
    /// The decoded record
    pub record: R,
    /// The edition to present when replacing it
    pub edition: Edition,
}

impl<R> Versioned<R> {
    /// Discards the edition.
    pub fn into_record(self) -> R {
        self.record
    }
}
