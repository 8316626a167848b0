use std::sync::Arc;

use async_trait::async_trait;

use crate::{Edition, Record, StoreError, Versioned};

mod memory;
pub use memory::*;

#[cfg(any(test, feature = "helpers"))]
mod measure;
#[cfg(any(test, feature = "helpers"))]
pub use measure::*;

/// A [DocumentStore] is a facade over some storage substrate that keeps
/// [Record]s in named collections, looked up by id or by predicate.
///
/// Implementations must enforce [Record::unique_keys] and the edition check
/// of [DocumentStore::replace] atomically; callers rely on both to close
/// check-then-write races.
#[async_trait]
pub trait DocumentStore: Clone + Send + Sync + 'static {
    /// Retrieve the record (if any) stored against the given id
    async fn get<R: Record>(&self, id: &str) -> Result<Option<Versioned<R>>, StoreError>;

    /// Retrieve every record of the collection matching `filter`, ordered by id
    async fn find<R: Record>(
        &self,
        filter: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Vec<Versioned<R>>, StoreError>;

    /// Store a new record, returning its first edition
    async fn insert<R: Record>(&self, record: &R) -> Result<Edition, StoreError>;

    /// Overwrite a record, provided it is still at `edition`
    async fn replace<R: Record>(&self, record: &R, edition: Edition)
    -> Result<Edition, StoreError>;

    /// Retrieve the first record matching `filter`
    async fn find_one<R: Record>(
        &self,
        filter: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Option<Versioned<R>>, StoreError> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    /// Count the records matching `filter`
    async fn count<R: Record>(
        &self,
        filter: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<usize, StoreError> {
        Ok(self.find(filter).await?.len())
    }
}

#[async_trait]
impl<T> DocumentStore for Arc<T>
where
    T: DocumentStore,
{
    async fn get<R: Record>(&self, id: &str) -> Result<Option<Versioned<R>>, StoreError> {
        self.as_ref().get(id).await
    }

    async fn find<R: Record>(
        &self,
        filter: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Vec<Versioned<R>>, StoreError> {
        self.as_ref().find(filter).await
    }

    async fn insert<R: Record>(&self, record: &R) -> Result<Edition, StoreError> {
        self.as_ref().insert(record).await
    }

    async fn replace<R: Record>(
        &self,
        record: &R,
        edition: Edition,
    ) -> Result<Edition, StoreError> {
        self.as_ref().replace(record, edition).await
    }
}
