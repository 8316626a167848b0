//! The decision function over (principal, resource, request).
//!
//! Rules are plain functions over the principal's [Role] and its relation
//! to the resource, matched exhaustively. [AuthorizationEngine] adds the
//! delegated-grant lookup and writes exactly one audit entry per decision.

use std::fmt;

use medvault_storage::{DocumentStore, Versioned};

use crate::{
    AccessGrant, AuditAction, AuditEvent, AuditLogger, Capability, DocumentId, GrantId,
    GrantStore, MedicalDocument, MedvaultError, Principal, RequestContext, ResourceType, Role,
    UserId,
};

/// Why a principal was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// The patient the document is about
    PatientOwner,
    /// The doctor who authored the document (or, for listings, one of the
    /// patient's documents)
    AuthoringDoctor,
    /// Any administrator
    Administrator,
    /// An effective delegated grant
    Grant(GrantId),
    /// The grantor of the grant being revoked
    Grantor,
    /// The grantee of the grant being revoked
    Grantee,
    /// Any doctor, for the patient directory
    Clinician,
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Basis::PatientOwner => f.write_str("patient_owner"),
            Basis::AuthoringDoctor => f.write_str("authoring_doctor"),
            Basis::Administrator => f.write_str("administrator"),
            Basis::Grant(id) => write!(f, "grant:{id}"),
            Basis::Grantor => f.write_str("grantor"),
            Basis::Grantee => f.write_str("grantee"),
            Basis::Clinician => f.write_str("clinician"),
        }
    }
}

/// Why a principal was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The principal lacks the capability
    Forbidden,
    /// The resource does not exist or is soft-deleted
    NotFound,
}

/// The outcome of one authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allow(Basis),
    /// The request is turned away
    Deny(DenyReason),
}

impl Decision {
    /// Whether the decision allows the request.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// Turn a denial into the matching error, describing the resource as
    /// `resource`.
    pub fn into_result(self, resource: &str) -> Result<Basis, MedvaultError> {
        match self {
            Decision::Allow(basis) => Ok(basis),
            Decision::Deny(DenyReason::Forbidden) => Err(MedvaultError::Forbidden(format!(
                "Access denied to {resource}"
            ))),
            Decision::Deny(DenyReason::NotFound) => {
                Err(MedvaultError::NotFound(format!("{resource} not found")))
            }
        }
    }
}

/// What is being asked of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentRequest {
    /// Exercise a capability over the document
    Access(Capability),
    /// Create, change or list the grants on the document
    Delegate,
}

impl fmt::Display for DocumentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentRequest::Access(capability) => write!(f, "{capability}"),
            DocumentRequest::Delegate => f.write_str("delegate"),
        }
    }
}

/// Which standing relation to `document` lets `principal` exercise
/// `capability` without a grant.
///
/// A patient owner may read and write their own record; the authoring
/// doctor and administrators may do anything.
pub fn access_basis(
    principal: &Principal,
    document: &MedicalDocument,
    capability: Capability,
) -> Option<Basis> {
    match principal.role {
        Role::Patient if principal.id == document.patient_id && capability <= Capability::Write => {
            Some(Basis::PatientOwner)
        }
        Role::Doctor if principal.id == document.doctor_id => Some(Basis::AuthoringDoctor),
        Role::Admin => Some(Basis::Administrator),
        Role::Patient | Role::Doctor => None,
    }
}

/// Who may grant access to `document`. Grants are never consulted, so a
/// grantee cannot delegate further.
pub fn delegation_basis(principal: &Principal, document: &MedicalDocument) -> Option<Basis> {
    match principal.role {
        Role::Patient if principal.id == document.patient_id => Some(Basis::PatientOwner),
        Role::Doctor if principal.id == document.doctor_id => Some(Basis::AuthoringDoctor),
        Role::Admin => Some(Basis::Administrator),
        Role::Patient | Role::Doctor => None,
    }
}

/// Who may revoke `grant`: its grantor, its grantee, or an administrator.
pub fn revocation_basis(principal: &Principal, grant: &AccessGrant) -> Option<Basis> {
    match principal.role {
        Role::Admin => Some(Basis::Administrator),
        Role::Patient | Role::Doctor if principal.id == grant.grantor_id => Some(Basis::Grantor),
        Role::Patient | Role::Doctor if principal.id == grant.grantee_id => Some(Basis::Grantee),
        Role::Patient | Role::Doctor => None,
    }
}

/// Who may browse the patient directory: doctors and administrators.
pub fn directory_basis(principal: &Principal) -> Option<Basis> {
    match principal.role {
        Role::Doctor => Some(Basis::Clinician),
        Role::Admin => Some(Basis::Administrator),
        Role::Patient => None,
    }
}

/// Decides requests and records every decision.
#[derive(Clone)]
pub struct AuthorizationEngine<S>
where
    S: DocumentStore,
{
    store: S,
    grants: GrantStore<S>,
    audit: AuditLogger<S>,
}

impl<S> AuthorizationEngine<S>
where
    S: DocumentStore,
{
    /// Decide against documents in `store`, consulting `grants` and writing
    /// to `audit`.
    pub fn new(store: S, grants: GrantStore<S>, audit: AuditLogger<S>) -> Self {
        Self {
            store,
            grants,
            audit,
        }
    }

    /// The document with the given id, unless absent or soft-deleted.
    pub async fn live_document(
        &self,
        id: DocumentId,
    ) -> Result<Option<Versioned<MedicalDocument>>, MedvaultError> {
        Ok(self
            .store
            .get::<MedicalDocument>(&id.to_string())
            .await?
            .filter(|document| !document.record.is_deleted))
    }

    /// May `principal` exercise `capability` over the document?
    ///
    /// The first matching rule wins: patient owner, authoring doctor,
    /// administrator, then an effective grant whose level covers the
    /// capability. A soft-deleted document is denied as not found.
    pub async fn decide(
        &self,
        principal: &Principal,
        document_id: DocumentId,
        capability: Capability,
        context: &RequestContext,
    ) -> Result<Decision, MedvaultError> {
        let (decision, _) = self
            .judge(principal, document_id, DocumentRequest::Access(capability), context)
            .await?;
        Ok(decision)
    }

    /// Like [AuthorizationEngine::decide], but for any [DocumentRequest],
    /// turning a denial into an error and handing back the document when
    /// allowed.
    pub async fn authorize_document(
        &self,
        principal: &Principal,
        document_id: DocumentId,
        request: DocumentRequest,
        context: &RequestContext,
    ) -> Result<(Basis, Versioned<MedicalDocument>), MedvaultError> {
        let (decision, document) = self.judge(principal, document_id, request, context).await?;
        let basis = decision.into_result(&format!("Medical document {document_id}"))?;
        let document = document.ok_or_else(|| {
            MedvaultError::Internal(format!("Medical document {document_id} vanished"))
        })?;
        Ok((basis, document))
    }

    async fn judge(
        &self,
        principal: &Principal,
        document_id: DocumentId,
        request: DocumentRequest,
        context: &RequestContext,
    ) -> Result<(Decision, Option<Versioned<MedicalDocument>>), MedvaultError> {
        let document = self.live_document(document_id).await?;

        let decision = match (&document, request) {
            (None, _) => Decision::Deny(DenyReason::NotFound),
            (Some(document), DocumentRequest::Delegate) => {
                match delegation_basis(principal, &document.record) {
                    Some(basis) => Decision::Allow(basis),
                    None => Decision::Deny(DenyReason::Forbidden),
                }
            }
            (Some(document), DocumentRequest::Access(capability)) => {
                self.access(principal, &document.record, capability).await?
            }
        };

        self.record(
            principal,
            ResourceType::MedicalDocument,
            document_id.to_string(),
            &request.to_string(),
            decision,
            context,
        )
        .await?;

        Ok((decision, document))
    }

    async fn access(
        &self,
        principal: &Principal,
        document: &MedicalDocument,
        capability: Capability,
    ) -> Result<Decision, MedvaultError> {
        if let Some(basis) = access_basis(principal, document, capability) {
            return Ok(Decision::Allow(basis));
        }

        Ok(
            match self.grants.effective_for(principal.id, document.id).await? {
                Some(grant) if grant.access_level.covers(capability) => {
                    Decision::Allow(Basis::Grant(grant.id))
                }
                _ => Decision::Deny(DenyReason::Forbidden),
            },
        )
    }

    /// May `principal` revoke `grant`?
    pub async fn authorize_revocation(
        &self,
        principal: &Principal,
        grant: &AccessGrant,
        context: &RequestContext,
    ) -> Result<Basis, MedvaultError> {
        let decision = match revocation_basis(principal, grant) {
            Some(basis) => Decision::Allow(basis),
            None => Decision::Deny(DenyReason::Forbidden),
        };

        self.record(
            principal,
            ResourceType::AccessGrant,
            grant.id.to_string(),
            "revoke",
            decision,
            context,
        )
        .await?;

        decision.into_result(&format!("Access grant {}", grant.id))
    }

    /// May `principal` list the documents of `patient_id`?
    ///
    /// The patient themself and administrators may; so may a doctor who
    /// authored at least one live document for the patient.
    pub async fn authorize_patient_listing(
        &self,
        principal: &Principal,
        patient_id: UserId,
        context: &RequestContext,
    ) -> Result<Basis, MedvaultError> {
        let basis = match principal.role {
            Role::Patient if principal.id == patient_id => Some(Basis::PatientOwner),
            Role::Admin => Some(Basis::Administrator),
            Role::Doctor => {
                let doctor_id = principal.id;
                let authored = self
                    .store
                    .count::<MedicalDocument>(&|document| {
                        document.doctor_id == doctor_id
                            && document.patient_id == patient_id
                            && !document.is_deleted
                    })
                    .await?;
                (authored > 0).then_some(Basis::AuthoringDoctor)
            }
            Role::Patient => None,
        };
        let decision = basis.map_or(Decision::Deny(DenyReason::Forbidden), Decision::Allow);

        self.record(
            principal,
            ResourceType::Patient,
            patient_id.to_string(),
            "list",
            decision,
            context,
        )
        .await?;

        decision.into_result(&format!("Records of patient {patient_id}"))
    }

    /// May `principal` browse the patient directory?
    pub async fn authorize_directory(
        &self,
        principal: &Principal,
        context: &RequestContext,
    ) -> Result<Basis, MedvaultError> {
        let decision =
            directory_basis(principal).map_or(Decision::Deny(DenyReason::Forbidden), Decision::Allow);

        self.record(
            principal,
            ResourceType::Patient,
            "directory".to_string(),
            "browse",
            decision,
            context,
        )
        .await?;

        decision.into_result("Patient directory")
    }

    /// May `principal` perform system administration?
    pub async fn authorize_administration(
        &self,
        principal: &Principal,
        context: &RequestContext,
    ) -> Result<Basis, MedvaultError> {
        let decision = match principal.role {
            Role::Admin => Decision::Allow(Basis::Administrator),
            Role::Patient | Role::Doctor => Decision::Deny(DenyReason::Forbidden),
        };

        self.record(
            principal,
            ResourceType::System,
            "system".to_string(),
            "administer",
            decision,
            context,
        )
        .await?;

        decision.into_result("Administration")
    }

    async fn record(
        &self,
        principal: &Principal,
        resource_type: ResourceType,
        resource_id: String,
        request: &str,
        decision: Decision,
        context: &RequestContext,
    ) -> Result<(), MedvaultError> {
        let event = match decision {
            Decision::Allow(basis) => {
                AuditEvent::new(AuditAction::AuthorizationGranted, resource_type)
                    .detail("basis", basis)
            }
            Decision::Deny(reason) => {
                tracing::debug!(
                    user_id = %principal.id,
                    role = %principal.role,
                    %resource_type,
                    %resource_id,
                    request,
                    ?reason,
                    "authorization denied"
                );
                let message = match reason {
                    DenyReason::Forbidden => "FORBIDDEN",
                    DenyReason::NotFound => "NOT_FOUND",
                };
                AuditEvent::new(AuditAction::AuthorizationDenied, resource_type).failed(message)
            }
        };

        self.audit
            .record(
                event
                    .by(principal.id)
                    .on(resource_id)
                    .detail("role", principal.role)
                    .detail("request", request),
                context,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use medvault_common::Checksum;

    use super::*;
    use crate::{DocumentType, KeyId};

    fn document(patient_id: UserId, doctor_id: UserId) -> MedicalDocument {
        let now = Utc::now();
        MedicalDocument {
            id: DocumentId::generate(),
            patient_id,
            doctor_id,
            document_type: DocumentType::Diagnosis,
            title: "Diagnosis".into(),
            description: None,
            mime_type: "text/plain".into(),
            content_length: 0,
            sealed_content: Vec::new(),
            encryption_key_id: KeyId::generate(),
            checksum: Checksum::of(&[]),
            is_deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        }
    }

    fn principal(role: Role) -> Principal {
        Principal {
            id: UserId::generate(),
            role,
        }
    }

    #[test]
    fn it_limits_patient_owners_to_read_and_write() {
        let patient = principal(Role::Patient);
        let document = document(patient.id, UserId::generate());

        assert_eq!(
            access_basis(&patient, &document, Capability::Write),
            Some(Basis::PatientOwner)
        );
        assert_eq!(access_basis(&patient, &document, Capability::Admin), None);
    }

    #[test]
    fn it_gives_authors_and_admins_every_capability() {
        let doctor = principal(Role::Doctor);
        let admin = principal(Role::Admin);
        let document = document(UserId::generate(), doctor.id);

        assert_eq!(
            access_basis(&doctor, &document, Capability::Admin),
            Some(Basis::AuthoringDoctor)
        );
        assert_eq!(
            access_basis(&admin, &document, Capability::Admin),
            Some(Basis::Administrator)
        );
    }

    #[test]
    fn it_gives_strangers_nothing_without_a_grant() {
        let document = document(UserId::generate(), UserId::generate());

        for role in [Role::Patient, Role::Doctor] {
            let stranger = principal(role);
            assert_eq!(access_basis(&stranger, &document, Capability::Read), None);
            assert_eq!(delegation_basis(&stranger, &document), None);
        }
    }

    #[test]
    fn it_opens_the_directory_to_doctors_and_admins() {
        assert_eq!(
            directory_basis(&principal(Role::Doctor)),
            Some(Basis::Clinician)
        );
        assert_eq!(
            directory_basis(&principal(Role::Admin)),
            Some(Basis::Administrator)
        );
        assert_eq!(directory_basis(&principal(Role::Patient)), None);
    }

    #[test]
    fn it_turns_denials_into_errors() {
        let forbidden = Decision::Deny(DenyReason::Forbidden).into_result("thing");
        let missing = Decision::Deny(DenyReason::NotFound).into_result("thing");

        assert!(matches!(forbidden, Err(MedvaultError::Forbidden(_))));
        assert!(matches!(missing, Err(MedvaultError::NotFound(_))));
        assert_eq!(
            Decision::Allow(Basis::Administrator).into_result("thing"),
            Ok(Basis::Administrator)
        );
    }
}
