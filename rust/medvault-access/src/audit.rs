//! The append-only audit trail.
//!
//! [AuditLogger] is the only writer of [AuditEntry] records and exposes no
//! way to change or remove one. A failed write is never swallowed: it is
//! logged and surfaces as [MedvaultError::Internal], so the operation that
//! triggered it fails too.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Duration, Utc};
use medvault_common::{Clock, SharedClock};
use medvault_storage::{DocumentStore, Record};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{AuditEntryId, MedvaultError, RequestContext, UserId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// An account was created
    UserRegistered,
    /// An account was activated or deactivated
    UserStatusChanged,
    /// A caller could not be resolved to an active user
    AuthenticationFailed,
    /// An authorization decision allowed a request
    AuthorizationGranted,
    /// An authorization decision denied a request
    AuthorizationDenied,
    /// A document was stored
    DocumentUploaded,
    /// A document was read
    DocumentViewed,
    /// A document was soft-deleted
    DocumentDeleted,
    /// A stored document no longer matched its checksum
    DocumentIntegrityFailed,
    /// A patient's documents were listed
    PatientRecordsListed,
    /// A grant was created
    AccessGranted,
    /// An active grant's terms were changed
    AccessGrantUpdated,
    /// A grant was revoked
    AccessRevoked,
    /// The grants on a document were listed
    AccessGrantsListed,
    /// A data key was issued for a new document
    KeyIssued,
    /// A data key was released to a reader
    KeyReleased,
    /// A data key was withheld
    KeyReleaseDenied,
    /// System statistics were read
    StatisticsViewed,
    /// A user read their own profile
    ProfileViewed,
    /// A user changed their own profile
    ProfileUpdated,
    /// An administrator listed accounts
    UsersListed,
    /// An administrator read one account
    UserViewed,
    /// The patient directory was listed
    PatientsListed,
    /// One patient's directory entry was read
    PatientViewed,
}

impl AuditAction {
    /// The SCREAMING_SNAKE_CASE name stored with each entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UserRegistered => "USER_REGISTERED",
            AuditAction::UserStatusChanged => "USER_STATUS_CHANGED",
            AuditAction::AuthenticationFailed => "AUTHENTICATION_FAILED",
            AuditAction::AuthorizationGranted => "AUTHORIZATION_GRANTED",
            AuditAction::AuthorizationDenied => "AUTHORIZATION_DENIED",
            AuditAction::DocumentUploaded => "DOCUMENT_UPLOADED",
            AuditAction::DocumentViewed => "DOCUMENT_VIEWED",
            AuditAction::DocumentDeleted => "DOCUMENT_DELETED",
            AuditAction::DocumentIntegrityFailed => "DOCUMENT_INTEGRITY_FAILED",
            AuditAction::PatientRecordsListed => "PATIENT_RECORDS_LISTED",
            AuditAction::AccessGranted => "ACCESS_GRANTED",
            AuditAction::AccessGrantUpdated => "ACCESS_GRANT_UPDATED",
            AuditAction::AccessRevoked => "ACCESS_REVOKED",
            AuditAction::AccessGrantsListed => "ACCESS_GRANTS_LISTED",
            AuditAction::KeyIssued => "KEY_ISSUED",
            AuditAction::KeyReleased => "KEY_RELEASED",
            AuditAction::KeyReleaseDenied => "KEY_RELEASE_DENIED",
            AuditAction::StatisticsViewed => "STATISTICS_VIEWED",
            AuditAction::ProfileViewed => "PROFILE_VIEWED",
            AuditAction::ProfileUpdated => "PROFILE_UPDATED",
            AuditAction::UsersListed => "USERS_LISTED",
            AuditAction::UserViewed => "USER_VIEWED",
            AuditAction::PatientsListed => "PATIENTS_LISTED",
            AuditAction::PatientViewed => "PATIENT_VIEWED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of thing an entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// An account
    User,
    /// A stored medical document
    MedicalDocument,
    /// A delegation over one document
    AccessGrant,
    /// A per-document data key
    EncryptionKey,
    /// A patient, or their records as a whole
    Patient,
    /// The service itself
    System,
}

impl ResourceType {
    /// The SCREAMING_SNAKE_CASE name stored with each entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::User => "USER",
            ResourceType::MedicalDocument => "MEDICAL_DOCUMENT",
            ResourceType::AccessGrant => "ACCESS_GRANT",
            ResourceType::EncryptionKey => "ENCRYPTION_KEY",
            ResourceType::Patient => "PATIENT",
            ResourceType::System => "SYSTEM",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Time-ordered identifier
    pub id: AuditEntryId,
    /// Absent when the caller could not be identified
    pub user_id: Option<UserId>,
    /// What happened
    pub action: AuditAction,
    /// The kind of resource acted upon
    pub resource_type: ResourceType,
    /// The resource acted upon, when there is one
    pub resource_id: Option<String>,
    /// Whether the operation succeeded
    pub success: bool,
    /// Why the operation failed
    pub error_message: Option<String>,
    /// Operation-specific facts
    pub details: BTreeMap<String, String>,
    /// Origin address of the request
    pub ip_address: Option<String>,
    /// Client the request came from
    pub user_agent: Option<String>,
    /// Correlates every entry written while serving one request
    pub request_id: Ulid,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Earliest time an external retention job may purge the entry
    pub retain_until: DateTime<Utc>,
}

impl Record for AuditEntry {
    const COLLECTION: &'static str = "audit_log";

    fn id(&self) -> String {
        self.id.to_string()
    }
}

/// An entry about to be recorded.
///
/// ```rust
/// use medvault_access::{AuditAction, AuditEvent, ResourceType, UserId};
///
/// let event = AuditEvent::new(AuditAction::AccessRevoked, ResourceType::AccessGrant)
///     .by(UserId::generate())
///     .on("01HZX3Q5V5V1T4KJ1C6W7Y8Z9A")
///     .detail("access_level", "read");
///
/// assert!(event.success);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Who acted, when known
    pub actor: Option<UserId>,
    /// What happened
    pub action: AuditAction,
    /// The kind of resource acted upon
    pub resource_type: ResourceType,
    /// The resource acted upon
    pub resource_id: Option<String>,
    /// Whether the operation succeeded
    pub success: bool,
    /// Why the operation failed
    pub error_message: Option<String>,
    /// Operation-specific facts
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    /// A successful `action` on a resource of `resource_type`.
    pub fn new(action: AuditAction, resource_type: ResourceType) -> Self {
        Self {
            actor: None,
            action,
            resource_type,
            resource_id: None,
            success: true,
            error_message: None,
            details: BTreeMap::new(),
        }
    }

    /// Attribute the event to `actor`.
    pub fn by(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Name the resource acted upon.
    pub fn on(mut self, resource_id: impl ToString) -> Self {
        self.resource_id = Some(resource_id.to_string());
        self
    }

    /// Add a free-form detail.
    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    /// Mark the event as a failure.
    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error_message.into());
        self
    }

    /// Mark the event as failed when `result` is an error.
    pub fn outcome<T>(self, result: &Result<T, MedvaultError>) -> Self {
        match result {
            Ok(_) => self,
            Err(error) => self.failed(error.to_string()),
        }
    }
}

/// Appends [AuditEntry]s to a [DocumentStore].
#[derive(Clone)]
pub struct AuditLogger<S>
where
    S: DocumentStore,
{
    store: S,
    clock: SharedClock,
    retention: Duration,
}

impl<S> AuditLogger<S>
where
    S: DocumentStore,
{
    /// Log into `store`, keeping each entry for `retention_days`.
    pub fn new(store: S, clock: SharedClock, retention_days: u32) -> Self {
        Self {
            store,
            clock,
            retention: Duration::days(i64::from(retention_days)),
        }
    }

    /// Append `event`, enriched with the origin of `context`.
    pub async fn record(
        &self,
        event: AuditEvent,
        context: &RequestContext,
    ) -> Result<AuditEntryId, MedvaultError> {
        let now = self.clock.now();
        let retain_until = now.checked_add_signed(self.retention).ok_or_else(|| {
            tracing::error!(action = %event.action, "audit retention overflows the calendar");
            MedvaultError::Internal("Audit retention is out of range".into())
        })?;
        let entry = AuditEntry {
            id: AuditEntryId::generate(),
            user_id: event.actor,
            action: event.action,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            success: event.success,
            error_message: event.error_message,
            details: event.details,
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            request_id: context.request_id,
            created_at: now,
            retain_until,
        };

        match self.store.insert(&entry).await {
            Ok(_) => {
                tracing::info!(
                    action = %entry.action,
                    resource_type = %entry.resource_type,
                    resource_id = entry.resource_id.as_deref().unwrap_or("-"),
                    user_id = ?entry.user_id,
                    success = entry.success,
                    request_id = %entry.request_id,
                    "audit"
                );
                Ok(entry.id)
            }
            Err(error) => {
                tracing::error!(
                    action = %entry.action,
                    request_id = %entry.request_id,
                    %error,
                    "failed to write audit entry"
                );
                Err(MedvaultError::Internal(format!(
                    "Audit log write failed: {error}"
                )))
            }
        }
    }

    /// Read-only access for reporting.
    pub fn report(&self) -> AuditReport<S> {
        AuditReport {
            store: self.store.clone(),
        }
    }
}

/// Counts over the audit trail. Nothing but statistics reads the log.
#[derive(Clone)]
pub struct AuditReport<S>
where
    S: DocumentStore,
{
    store: S,
}

impl<S> AuditReport<S>
where
    S: DocumentStore,
{
    /// Total number of entries.
    pub async fn total(&self) -> Result<usize, MedvaultError> {
        Ok(self.store.count::<AuditEntry>(&|_| true).await?)
    }

    /// Number of entries recording `action`.
    pub async fn count(&self, action: AuditAction) -> Result<usize, MedvaultError> {
        Ok(self
            .store
            .count::<AuditEntry>(&|entry| entry.action == action)
            .await?)
    }
}
