#![allow(dead_code)]

use anyhow::Result;
use medvault_access::{
    AuditAction, AuditEntry, DocumentId, DocumentType, MasterKey, MedicalRecords, Registration,
    RequestContext, Role, Settings, StaticCredentialVerifier, Upload, UserId,
};
use medvault_common::ManualClock;
use medvault_storage::{DocumentStore, MeasuredDocumentStore, MemoryDocumentStore};
use ulid::Ulid;

pub type Store = MeasuredDocumentStore<MemoryDocumentStore>;

/// A service over an in-memory store, a token verifier and a clock that only
/// moves when a test moves it.
pub struct Clinic {
    pub records: MedicalRecords<Store, StaticCredentialVerifier>,
    pub store: Store,
    pub verifier: StaticCredentialVerifier,
    pub clock: ManualClock,
}

impl Clinic {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = MeasuredDocumentStore::new(<MemoryDocumentStore>::default());
        let verifier = StaticCredentialVerifier::default();
        let clock = ManualClock::starting_now();
        let records = MedicalRecords::new(
            store.clone(),
            verifier.clone(),
            clock.shared(),
            settings,
            MasterKey::generate(),
        );

        Self {
            records,
            store,
            verifier,
            clock,
        }
    }

    /// Register a user and sign them in.
    pub async fn enroll(&self, role: Role, name: &str) -> Result<(UserId, RequestContext)> {
        let user = self
            .records
            .register_user(
                &RequestContext::anonymous(),
                Registration {
                    email: format!("{name}@clinic.example"),
                    credential_hash: format!("hash-of-{name}"),
                    role,
                    first_name: name.to_string(),
                    last_name: "Tester".into(),
                },
            )
            .await?;

        let context = RequestContext::authenticated(self.verifier.issue(user.id))
            .from_origin("192.0.2.10", "medvault-tests");
        Ok((user.id, context))
    }

    /// Upload `content` about `patient_id`. When a patient uploads, `doctor_id`
    /// names the author.
    pub async fn upload(
        &self,
        context: &RequestContext,
        patient_id: UserId,
        doctor_id: Option<UserId>,
        content: &[u8],
    ) -> Result<DocumentId> {
        let document = self
            .records
            .upload_document(
                context,
                Upload {
                    patient_id,
                    doctor_id,
                    document_type: DocumentType::LabResult,
                    title: "Blood panel".into(),
                    description: Some("Quarterly".into()),
                    mime_type: "text/plain".into(),
                    content: content.to_vec(),
                },
            )
            .await?;
        Ok(document.id)
    }

    /// Audit entries written while serving `context`.
    pub async fn entries_for(&self, context: &RequestContext) -> Result<Vec<AuditEntry>> {
        let request_id = context.request_id;
        Ok(self
            .store
            .find::<AuditEntry>(&|entry| entry.request_id == request_id)
            .await?
            .into_iter()
            .map(|entry| entry.record)
            .collect())
    }

    pub async fn count_all(&self) -> Result<usize> {
        Ok(self.store.count::<AuditEntry>(&|_| true).await?)
    }

    pub async fn count(&self, action: AuditAction) -> Result<usize> {
        Ok(self
            .store
            .count::<AuditEntry>(&|entry| entry.action == action)
            .await?)
    }
}

/// The same caller, as a new request.
pub fn again(context: &RequestContext) -> RequestContext {
    RequestContext {
        request_id: Ulid::new(),
        ..context.clone()
    }
}
