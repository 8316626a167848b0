#![warn(missing_docs)]

//! This crate contains the document store abstraction that the medvault core
//! is written against, together with an in-memory backend.
//!
//! Every persisted entity implements [Record], which names its collection and
//! the unique keys the store must enforce. Components receive a
//! [DocumentStore] at construction and never reach for a global handle:
//!
//! ```rust
//! use medvault_storage::{DocumentStore, MemoryDocumentStore, Record};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Badge {
//!     id: String,
//!     holder: String,
//! }
//!
//! impl Record for Badge {
//!     const COLLECTION: &'static str = "badges";
//!
//!     fn id(&self) -> String {
//!         self.id.clone()
//!     }
//!
//!     fn unique_keys(&self) -> Vec<String> {
//!         vec![format!("holder:{}", self.holder)]
//!     }
//! }
//!
//! # async fn example() -> Result<(), medvault_storage::StoreError> {
//! let store = <MemoryDocumentStore>::default();
//! let badge = Badge { id: "b1".into(), holder: "ada".into() };
//!
//! let edition = store.insert(&badge).await?;
//! let stored = store.get::<Badge>("b1").await?.expect("just inserted");
//! assert_eq!(stored.edition, edition);
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::*;

mod record;
pub use record::*;

mod encoder;
pub use encoder::*;

mod backend;
pub use backend::*;
