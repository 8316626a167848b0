mod common;

use common::{Clinic, again};
use medvault_access::{
    AccessGrant, AccessLevel, AuditEntry, Basis, Capability, Credentials, Decision, DenyReason,
    GrantRequest, MedvaultError, RequestContext, Role, UserId,
};
use medvault_storage::{DocumentStore, Record};
use pretty_assertions::assert_eq;
use testresult::TestResult;

fn grant(
    document_id: medvault_access::DocumentId,
    grantee_id: UserId,
    access_level: AccessLevel,
) -> GrantRequest {
    GrantRequest {
        document_id,
        grantee_id,
        access_level,
        expires_at: None,
        reason: None,
    }
}

#[tokio::test]
async fn it_fails_operations_whose_audit_entries_cannot_be_written() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "p").await?;
    let (_, as_doctor) = clinic.enroll(Role::Doctor, "d").await?;
    let (consultant, _) = clinic.enroll(Role::Doctor, "c").await?;
    let document = clinic.upload(&as_doctor, patient, None, b"panel").await?;

    clinic.store.reject_writes_to(AuditEntry::COLLECTION);

    let authorized = clinic
        .records
        .authorize(&again(&as_patient), document, Capability::Read)
        .await;
    let granted = clinic
        .records
        .grant_access(&again(&as_patient), grant(document, consultant, AccessLevel::Read))
        .await;
    let key = clinic
        .records
        .resolve_document_key(&again(&as_doctor), document)
        .await;
    let forged = clinic
        .records
        .authorize(
            &RequestContext::authenticated(Credentials::bearer("forged")),
            document,
            Capability::Read,
        )
        .await;

    assert!(matches!(authorized, Err(MedvaultError::Internal(_))));
    assert!(matches!(granted, Err(MedvaultError::Internal(_))));
    assert!(matches!(key, Err(MedvaultError::Internal(_))));
    assert!(matches!(forged, Err(MedvaultError::Internal(_))));

    clinic.store.accept_writes_to(AuditEntry::COLLECTION);

    assert_eq!(
        clinic
            .store
            .count::<AccessGrant>(&|grant| grant.grantee_id == consultant)
            .await?,
        0
    );
    Ok(())
}

#[tokio::test]
async fn it_undoes_a_new_grant_whose_entry_is_lost() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "p").await?;
    let (_, as_doctor) = clinic.enroll(Role::Doctor, "d").await?;
    let (consultant, as_consultant) = clinic.enroll(Role::Doctor, "c").await?;
    let document = clinic.upload(&as_doctor, patient, None, b"panel").await?;

    // The delegation decision is recorded; the ACCESS_GRANTED entry is not.
    clinic
        .store
        .reject_writes_to_after(AuditEntry::COLLECTION, 1);
    let granted = clinic
        .records
        .grant_access(&as_patient, grant(document, consultant, AccessLevel::Read))
        .await;
    clinic.store.accept_writes_to(AuditEntry::COLLECTION);

    assert!(matches!(granted, Err(MedvaultError::Internal(_))));
    assert_eq!(
        clinic
            .records
            .authorize(&as_consultant, document, Capability::Read)
            .await?,
        Decision::Deny(DenyReason::Forbidden)
    );
    assert_eq!(
        clinic
            .store
            .count::<AccessGrant>(&|grant| grant.grantee_id == consultant && grant.is_active)
            .await?,
        0
    );

    let retried = clinic
        .records
        .grant_access(&again(&as_patient), grant(document, consultant, AccessLevel::Read))
        .await?;
    assert!(retried.created);
    Ok(())
}

#[tokio::test]
async fn it_restores_an_updated_grant_whose_entry_is_lost() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "p").await?;
    let (_, as_doctor) = clinic.enroll(Role::Doctor, "d").await?;
    let (consultant, as_consultant) = clinic.enroll(Role::Doctor, "c").await?;
    let document = clinic.upload(&as_doctor, patient, None, b"panel").await?;
    let original = clinic
        .records
        .grant_access(&as_patient, grant(document, consultant, AccessLevel::Read))
        .await?;

    clinic
        .store
        .reject_writes_to_after(AuditEntry::COLLECTION, 1);
    let raised = clinic
        .records
        .grant_access(&again(&as_patient), grant(document, consultant, AccessLevel::Admin))
        .await;
    clinic.store.accept_writes_to(AuditEntry::COLLECTION);

    assert!(matches!(raised, Err(MedvaultError::Internal(_))));
    assert_eq!(
        clinic
            .records
            .authorize(&as_consultant, document, Capability::Read)
            .await?,
        Decision::Allow(Basis::Grant(original.id))
    );
    assert_eq!(
        clinic
            .records
            .authorize(&again(&as_consultant), document, Capability::Write)
            .await?,
        Decision::Deny(DenyReason::Forbidden)
    );
    let stored = clinic
        .store
        .get::<AccessGrant>(&original.id.to_string())
        .await?
        .ok_or("grant was not stored")?
        .record;
    assert_eq!(stored.access_level, AccessLevel::Read);
    assert!(stored.is_active);
    Ok(())
}
