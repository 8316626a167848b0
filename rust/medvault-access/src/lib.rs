#![warn(missing_docs)]

//! The core of the medvault medical records service: who may do what to
//! which medical document, and a faithful record of every such decision.
//!
//! Four components cooperate, all written against an injected
//! [`medvault_storage::DocumentStore`]:
//!
//! - the [GrantStore], a ledger of time-bound delegations over single
//!   documents;
//! - the [AuthorizationEngine], which decides requests from ownership,
//!   authorship, role and delegated grants;
//! - the [KeyManager], which issues per-document data keys wrapped under a
//!   [MasterKey] and releases them only to readers of the document;
//! - the [AuditLogger], which appends an [AuditEntry] for every decision and
//!   every operation, and fails the operation when it cannot.
//!
//! [MedicalRecords] wires them together behind the operations callers use.
//!
//! ```rust
//! use medvault_access::{
//!     Capability, DocumentType, MasterKey, MedicalRecords, Registration,
//!     RequestContext, Role, Settings, StaticCredentialVerifier, Upload,
//! };
//! use medvault_common::SystemClock;
//! use medvault_storage::MemoryDocumentStore;
//!
//! # async fn example() -> Result<(), medvault_access::MedvaultError> {
//! let verifier = StaticCredentialVerifier::default();
//! let records = MedicalRecords::new(
//!     <MemoryDocumentStore>::default(),
//!     verifier.clone(),
//!     SystemClock::shared(),
//!     Settings::default(),
//!     MasterKey::generate(),
//! );
//!
//! let anonymous = RequestContext::anonymous();
//! let register = |email: &str, role| Registration {
//!     email: email.into(),
//!     credential_hash: "opaque".into(),
//!     role,
//!     first_name: "Sam".into(),
//!     last_name: "Example".into(),
//! };
//! let patient = records.register_user(&anonymous, register("p@example.org", Role::Patient)).await?;
//! let doctor = records.register_user(&anonymous, register("d@example.org", Role::Doctor)).await?;
//!
//! let as_doctor = RequestContext::authenticated(verifier.issue(doctor.id));
//! let document = records
//!     .upload_document(
//!         &as_doctor,
//!         Upload {
//!             patient_id: patient.id,
//!             doctor_id: None,
//!             document_type: DocumentType::Diagnosis,
//!             title: "Follow-up".into(),
//!             description: None,
//!             mime_type: "text/plain".into(),
//!             content: b"all clear".to_vec(),
//!         },
//!     )
//!     .await?;
//!
//! let as_patient = RequestContext::authenticated(verifier.issue(patient.id));
//! let decision = records.authorize(&as_patient, document.id, Capability::Read).await?;
//! assert!(decision.is_allowed());
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::*;

mod identity;
pub use identity::*;

mod context;
pub use context::*;

mod settings;
pub use settings::*;

mod document;
pub use document::*;

mod grant;
pub use grant::*;

mod audit;
pub use audit::*;

mod authorization;
pub use authorization::*;

mod key;
pub use key::*;

mod service;
pub use service::*;
