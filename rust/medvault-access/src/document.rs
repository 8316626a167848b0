use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use medvault_common::Checksum;
use medvault_storage::Record;
use serde::{Deserialize, Serialize};

use crate::{DocumentId, KeyId, MedvaultError, UserId};

/// The kinds of medical document the service stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// Laboratory results
    LabResult,
    /// A prescription
    Prescription,
    /// A diagnosis
    Diagnosis,
    /// Imaging studies and reports
    Imaging,
    /// Notes from a consultation
    Consultation,
}

impl DocumentType {
    /// The snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::LabResult => "lab_result",
            DocumentType::Prescription => "prescription",
            DocumentType::Diagnosis => "diagnosis",
            DocumentType::Imaging => "imaging",
            DocumentType::Consultation => "consultation",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = MedvaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "lab_result" => Ok(DocumentType::LabResult),
            "prescription" => Ok(DocumentType::Prescription),
            "diagnosis" => Ok(DocumentType::Diagnosis),
            "imaging" => Ok(DocumentType::Imaging),
            "consultation" => Ok(DocumentType::Consultation),
            other => Err(MedvaultError::Validation(format!(
                "Invalid document type '{other}'. Must be one of: lab_result, prescription, diagnosis, imaging, consultation"
            ))),
        }
    }
}

/// A medical record about one patient, authored by one doctor.
///
/// Content is stored sealed under the document's data key (see
/// [crate::KeyManager]) and is never modified after upload. Deletion only
/// flips `is_deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalDocument {
    /// Stable identifier
    pub id: DocumentId,
    /// The patient the document is about
    pub patient_id: UserId,
    /// The authoring doctor
    pub doctor_id: UserId,
    /// What kind of record this is
    pub document_type: DocumentType,
    /// Short human-readable title
    pub title: String,
    /// Optional free text
    pub description: Option<String>,
    /// Media type of the plaintext
    pub mime_type: String,
    /// Length of the plaintext, in bytes
    pub content_length: usize,
    /// `nonce || ciphertext` under the data key named by `encryption_key_id`
    #[serde(with = "serde_bytes")]
    pub sealed_content: Vec<u8>,
    /// The data key sealing the content
    pub encryption_key_id: KeyId,
    /// Checksum of `sealed_content`
    pub checksum: Checksum,
    /// Soft-deletion flag; deleted documents are invisible to everyone
    pub is_deleted: bool,
    /// Upload time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Set on soft deletion
    pub deleted_at: Option<DateTime<Utc>>,
    /// Who soft-deleted the document
    pub deleted_by: Option<UserId>,
}

impl MedicalDocument {
    /// Whether the stored content still hashes to the recorded checksum.
    pub fn is_intact(&self) -> bool {
        self.checksum.matches(&self.sealed_content)
    }
}

impl Record for MedicalDocument {
    const COLLECTION: &'static str = "medical_documents";

    fn id(&self) -> String {
        self.id.to_string()
    }
}

/// What a reader of a document receives: the sealed blob and the id of the
/// key it is sealed under, never the key itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentView {
    /// Stable identifier
    pub id: DocumentId,
    /// The patient the document is about
    pub patient_id: UserId,
    /// The authoring doctor
    pub doctor_id: UserId,
    /// What kind of record this is
    pub document_type: DocumentType,
    /// Short human-readable title
    pub title: String,
    /// Optional free text
    pub description: Option<String>,
    /// Media type of the plaintext
    pub mime_type: String,
    /// Length of the plaintext, in bytes
    pub content_length: usize,
    #[serde(with = "serde_bytes")]
    /// `nonce || ciphertext`
    pub sealed_content: Vec<u8>,
    /// The key to request from the key manager
    pub encryption_key_id: KeyId,
    /// Checksum of `sealed_content`
    pub checksum: Checksum,
    /// Upload time
    pub created_at: DateTime<Utc>,
}

impl From<MedicalDocument> for DocumentView {
    fn from(document: MedicalDocument) -> Self {
        Self {
            id: document.id,
            patient_id: document.patient_id,
            doctor_id: document.doctor_id,
            document_type: document.document_type,
            title: document.title,
            description: document.description,
            mime_type: document.mime_type,
            content_length: document.content_length,
            sealed_content: document.sealed_content,
            encryption_key_id: document.encryption_key_id,
            checksum: document.checksum,
            created_at: document.created_at,
        }
    }
}

/// Document metadata, as returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    /// Stable identifier
    pub id: DocumentId,
    /// The patient the document is about
    pub patient_id: UserId,
    /// The authoring doctor
    pub doctor_id: UserId,
    /// What kind of record this is
    pub document_type: DocumentType,
    /// Short human-readable title
    pub title: String,
    /// Optional free text
    pub description: Option<String>,
    /// Media type of the plaintext
    pub mime_type: String,
    /// Length of the plaintext, in bytes
    pub content_length: usize,
    /// Upload time
    pub created_at: DateTime<Utc>,
}

impl From<&MedicalDocument> for DocumentSummary {
    fn from(document: &MedicalDocument) -> Self {
        Self {
            id: document.id,
            patient_id: document.patient_id,
            doctor_id: document.doctor_id,
            document_type: document.document_type,
            title: document.title.clone(),
            description: document.description.clone(),
            mime_type: document.mime_type.clone(),
            content_length: document.content_length,
            created_at: document.created_at,
        }
    }
}

/// A request to store a new document.
///
/// Doctors name the patient and author the document themselves. Patients
/// upload their own records and must name the authoring doctor.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    /// The patient the document is about
    pub patient_id: UserId,
    /// The authoring doctor; required when a patient uploads
    pub doctor_id: Option<UserId>,
    /// What kind of record this is
    pub document_type: DocumentType,
    /// Short human-readable title
    pub title: String,
    /// Optional free text
    pub description: Option<String>,
    /// Media type of `content`; empty means `application/octet-stream`
    pub mime_type: String,
    /// The plaintext
    pub content: Vec<u8>,
}
