use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{Edition, Record, StoreError, Versioned};

use super::DocumentStore;

/// A [MeasuredDocumentStore] acts as a proxy over a [DocumentStore]
/// implementation that measures reads and writes, and that can be told to
/// fail writes to chosen collections, immediately or once a number of
/// writes has gone through.
#[derive(Clone)]
pub struct MeasuredDocumentStore<Store>
where
    Store: DocumentStore,
{
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    /// Writes still admitted, per rejecting collection
    rejected: Arc<Mutex<BTreeMap<&'static str, usize>>>,
    store: Store,
}

impl<Store> MeasuredDocumentStore<Store>
where
    Store: DocumentStore,
{
    /// Wrap the provided [DocumentStore] so that reads and writes to it may be
    /// measured.
    pub fn new(store: Store) -> Self {
        Self {
            reads: Arc::new(AtomicUsize::default()),
            writes: Arc::new(AtomicUsize::default()),
            rejected: Arc::default(),
            store,
        }
    }

    /// The aggregate number of reads from the wrapped [DocumentStore]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// The aggregate number of writes to the wrapped [DocumentStore]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every subsequent write to `collection` fail with
    /// [StoreError::Backend]
    pub fn reject_writes_to(&self, collection: &'static str) {
        self.reject_writes_to_after(collection, 0);
    }

    /// Admit `admitted` more writes to `collection`, then fail every write
    /// after them with [StoreError::Backend]
    pub fn reject_writes_to_after(&self, collection: &'static str, admitted: usize) {
        self.rejected.lock().insert(collection, admitted);
    }

    /// Undo [MeasuredDocumentStore::reject_writes_to]
    pub fn accept_writes_to(&self, collection: &'static str) {
        self.rejected.lock().remove(collection);
    }

    fn admit_write(&self, collection: &'static str) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.rejected.lock().get_mut(collection) {
            Some(0) => Err(StoreError::Backend(format!(
                "Writes to {collection} are rejected"
            ))),
            Some(admitted) => {
                *admitted -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<Store> DocumentStore for MeasuredDocumentStore<Store>
where
    Store: DocumentStore,
{
    async fn get<R: Record>(&self, id: &str) -> Result<Option<Versioned<R>>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.store.get(id).await
    }

    async fn find<R: Record>(
        &self,
        filter: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Vec<Versioned<R>>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.store.find(filter).await
    }

    async fn insert<R: Record>(&self, record: &R) -> Result<Edition, StoreError> {
        self.admit_write(R::COLLECTION)?;
        self.store.insert(record).await
    }

    async fn replace<R: Record>(
        &self,
        record: &R,
        edition: Edition,
    ) -> Result<Edition, StoreError> {
        self.admit_write(R::COLLECTION)?;
        self.store.replace(record, edition).await
    }
}
