use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{CborEncoder, Edition, Encoder, Record, StoreError, Versioned};

use super::DocumentStore;

#[derive(Debug)]
struct Entry {
    bytes: Vec<u8>,
    edition: Edition,
    unique_keys: Vec<String>,
}

#[derive(Debug, Default)]
struct Collection {
    entries: HashMap<String, Entry>,
    /// unique key -> id of the record holding it
    unique: HashMap<String, String>,
}

impl Collection {
    fn check_unique(
        &self,
        collection: &'static str,
        id: &str,
        keys: &[String],
    ) -> Result<(), StoreError> {
        for key in keys {
            match self.unique.get(key) {
                Some(holder) if holder != id => {
                    return Err(StoreError::UniqueViolation {
                        collection,
                        key: key.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A trivial implementation of [DocumentStore] - backed by [HashMap]s - where
/// all records are kept encoded in memory and never persisted.
///
/// All writes to a collection happen under one write lock, so unique-key and
/// edition checks are atomic with the write they guard.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore<E = CborEncoder>
where
    E: Encoder,
{
    collections: Arc<RwLock<HashMap<&'static str, Collection>>>,
    encoder: E,
}

impl<E: Encoder> MemoryDocumentStore<E> {
    /// Create an empty store that encodes records with `encoder`
    pub fn with_encoder(encoder: E) -> Self {
        Self {
            collections: Arc::default(),
            encoder,
        }
    }
}

#[async_trait]
impl<E> DocumentStore for MemoryDocumentStore<E>
where
    E: Encoder,
{
    async fn get<R: Record>(&self, id: &str) -> Result<Option<Versioned<R>>, StoreError> {
        let collections = self.collections.read().await;
        let Some(entry) = collections
            .get(R::COLLECTION)
            .and_then(|collection| collection.entries.get(id))
        else {
            return Ok(None);
        };

        Ok(Some(Versioned {
            record: self.encoder.decode(&entry.bytes)?,
            edition: entry.edition,
        }))
    }

    async fn find<R: Record>(
        &self,
        filter: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Vec<Versioned<R>>, StoreError> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(R::COLLECTION) else {
            return Ok(Vec::new());
        };

        let mut ids: Vec<&String> = collection.entries.keys().collect();
        ids.sort();

        let mut matches = Vec::new();
        for id in ids {
            let entry = &collection.entries[id];
            let record: R = self.encoder.decode(&entry.bytes)?;
            if filter(&record) {
                matches.push(Versioned {
                    record,
                    edition: entry.edition,
                });
            }
        }

        Ok(matches)
    }

    async fn insert<R: Record>(&self, record: &R) -> Result<Edition, StoreError> {
        let bytes = self.encoder.encode(record)?;
        let id = record.id();
        let unique_keys = record.unique_keys();

        let mut collections = self.collections.write().await;
        let collection = collections.entry(R::COLLECTION).or_default();

        if collection.entries.contains_key(&id) {
            return Err(StoreError::DuplicateId {
                collection: R::COLLECTION,
                id,
            });
        }
        collection.check_unique(R::COLLECTION, &id, &unique_keys)?;

        for key in &unique_keys {
            collection.unique.insert(key.clone(), id.clone());
        }
        collection.entries.insert(
            id.clone(),
            Entry {
                bytes,
                edition: 1,
                unique_keys,
            },
        );

        tracing::trace!(collection = R::COLLECTION, %id, "inserted record");
        Ok(1)
    }

    async fn replace<R: Record>(
        &self,
        record: &R,
        edition: Edition,
    ) -> Result<Edition, StoreError> {
        let bytes = self.encoder.encode(record)?;
        let id = record.id();
        let unique_keys = record.unique_keys();

        let mut collections = self.collections.write().await;
        let collection = collections.entry(R::COLLECTION).or_default();

        let (found, released) = match collection.entries.get(&id) {
            Some(entry) => (entry.edition, entry.unique_keys.clone()),
            None => {
                return Err(StoreError::Missing {
                    collection: R::COLLECTION,
                    id,
                });
            }
        };
        if found != edition {
            return Err(StoreError::EditionMismatch {
                collection: R::COLLECTION,
                id,
                expected: edition,
                found,
            });
        }
        collection.check_unique(R::COLLECTION, &id, &unique_keys)?;

        for key in released {
            collection.unique.remove(&key);
        }
        for key in &unique_keys {
            collection.unique.insert(key.clone(), id.clone());
        }

        let next = found + 1;
        collection.entries.insert(
            id.clone(),
            Entry {
                bytes,
                edition: next,
                unique_keys,
            },
        );

        tracing::trace!(collection = R::COLLECTION, %id, edition = next, "replaced record");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::{DocumentStore, MemoryDocumentStore, Record, StoreError};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Seat {
        id: String,
        table: u32,
        occupied: bool,
        #[serde(with = "serde_bytes")]
        note: Vec<u8>,
    }

    impl Record for Seat {
        const COLLECTION: &'static str = "seats";

        fn id(&self) -> String {
            self.id.clone()
        }

        fn unique_keys(&self) -> Vec<String> {
            if self.occupied {
                vec![format!("table:{}", self.table)]
            } else {
                Vec::new()
            }
        }
    }

    fn seat(id: &str, table: u32, occupied: bool) -> Seat {
        Seat {
            id: id.into(),
            table,
            occupied,
            note: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn it_writes_and_reads_a_record() -> Result<()> {
        let store = <MemoryDocumentStore>::default();

        let edition = store.insert(&seat("a", 1, true)).await?;
        let stored = store.get::<Seat>("a").await?;

        assert_eq!(edition, 1);
        assert_eq!(stored.map(|seat| seat.record), Some(seat("a", 1, true)));
        assert_eq!(store.get::<Seat>("missing").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn it_rejects_duplicate_ids() -> Result<()> {
        let store = <MemoryDocumentStore>::default();
        store.insert(&seat("a", 1, false)).await?;

        let result = store.insert(&seat("a", 2, false)).await;

        assert!(matches!(result, Err(StoreError::DuplicateId { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn it_enforces_unique_keys_on_insert() -> Result<()> {
        let store = <MemoryDocumentStore>::default();
        store.insert(&seat("a", 1, true)).await?;

        let result = store.insert(&seat("b", 1, true)).await;

        assert_eq!(
            result,
            Err(StoreError::UniqueViolation {
                collection: "seats",
                key: "table:1".into()
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn it_releases_unique_keys_that_a_replace_drops() -> Result<()> {
        let store = <MemoryDocumentStore>::default();
        let edition = store.insert(&seat("a", 1, true)).await?;

        store.replace(&seat("a", 1, false), edition).await?;
        store.insert(&seat("b", 1, true)).await?;

        assert_eq!(store.count::<Seat>(&|seat| seat.occupied).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn it_refuses_a_replace_at_a_stale_edition() -> Result<()> {
        let store = <MemoryDocumentStore>::default();
        let first = store.insert(&seat("a", 1, true)).await?;
        let second = store.replace(&seat("a", 2, true), first).await?;

        let result = store.replace(&seat("a", 3, true), first).await;

        assert_eq!(second, 2);
        assert!(matches!(
            result,
            Err(StoreError::EditionMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn it_refuses_to_replace_a_missing_record() -> Result<()> {
        let store = <MemoryDocumentStore>::default();

        let result = store.replace(&seat("a", 1, true), 1).await;

        assert!(matches!(result, Err(StoreError::Missing { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn it_finds_records_in_id_order() -> Result<()> {
        let store = <MemoryDocumentStore>::default();
        for (id, table) in [("c", 3), ("a", 1), ("b", 2)] {
            store.insert(&seat(id, table, false)).await?;
        }

        let found = store.find::<Seat>(&|seat| seat.table > 1).await?;
        let ids: Vec<_> = found.into_iter().map(|seat| seat.record.id).collect();

        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_lets_only_one_concurrent_writer_claim_a_unique_key() -> Result<()> {
        let store = <MemoryDocumentStore>::default();

        let mut handles = Vec::new();
        for index in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(&seat(&format!("s{index}"), 7, true)).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await?.is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 1);
        Ok(())
    }
}
