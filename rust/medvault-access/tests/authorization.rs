mod common;

use common::{Clinic, again};
use medvault_access::{
    AccessLevel, AuditAction, AuditEntry, Basis, Capability, Credentials, Decision, DenyReason,
    GrantRequest, MedvaultError, RequestContext, ResourceType, Role,
};
use medvault_storage::DocumentStore;
use pretty_assertions::assert_eq;
use testresult::TestResult;

#[tokio::test]
async fn it_allows_reads_exactly_for_owner_author_admin_and_grantees() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "owner").await?;
    let (_, as_author) = clinic.enroll(Role::Doctor, "author").await?;
    let (_, as_admin) = clinic.enroll(Role::Admin, "admin").await?;
    let (grantee, as_grantee) = clinic.enroll(Role::Doctor, "grantee").await?;
    let (_, as_other_doctor) = clinic.enroll(Role::Doctor, "other").await?;
    let (_, as_other_patient) = clinic.enroll(Role::Patient, "neighbour").await?;
    let document = clinic.upload(&as_author, patient, None, b"panel").await?;
    let granted = clinic
        .records
        .grant_access(
            &as_patient,
            GrantRequest {
                document_id: document,
                grantee_id: grantee,
                access_level: AccessLevel::Read,
                expires_at: None,
                reason: None,
            },
        )
        .await?;

    let cases = [
        (&as_patient, Decision::Allow(Basis::PatientOwner)),
        (&as_author, Decision::Allow(Basis::AuthoringDoctor)),
        (&as_admin, Decision::Allow(Basis::Administrator)),
        (&as_grantee, Decision::Allow(Basis::Grant(granted.id))),
        (&as_other_doctor, Decision::Deny(DenyReason::Forbidden)),
        (&as_other_patient, Decision::Deny(DenyReason::Forbidden)),
    ];

    for (context, expected) in cases {
        let decision = clinic
            .records
            .authorize(&again(context), document, Capability::Read)
            .await?;
        assert_eq!(decision, expected);
    }
    Ok(())
}

#[tokio::test]
async fn it_denies_patient_owners_the_admin_capability() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "owner").await?;
    let (_, as_author) = clinic.enroll(Role::Doctor, "author").await?;
    let document = clinic.upload(&as_author, patient, None, b"panel").await?;

    let write = clinic
        .records
        .authorize(&as_patient, document, Capability::Write)
        .await?;
    let admin = clinic
        .records
        .authorize(&again(&as_patient), document, Capability::Admin)
        .await?;
    let delete = clinic.records.delete_document(&again(&as_patient), document).await;

    assert_eq!(write, Decision::Allow(Basis::PatientOwner));
    assert_eq!(admin, Decision::Deny(DenyReason::Forbidden));
    assert!(matches!(delete, Err(MedvaultError::Forbidden(_))));
    Ok(())
}

#[tokio::test]
async fn it_records_exactly_one_entry_per_authorization() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "owner").await?;
    let (_, as_author) = clinic.enroll(Role::Doctor, "author").await?;
    let (stranger, as_stranger) = clinic.enroll(Role::Doctor, "stranger").await?;
    let document = clinic.upload(&as_author, patient, None, b"panel").await?;

    let allowed = again(&as_patient);
    clinic
        .records
        .authorize(&allowed, document, Capability::Read)
        .await?;
    let entries = clinic.entries_for(&allowed).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::AuthorizationGranted);
    assert_eq!(entries[0].user_id, Some(patient));
    assert_eq!(entries[0].resource_type, ResourceType::MedicalDocument);
    assert_eq!(entries[0].resource_id, Some(document.to_string()));
    assert!(entries[0].success);

    let denied = again(&as_stranger);
    clinic
        .records
        .authorize(&denied, document, Capability::Read)
        .await?;
    let entries = clinic.entries_for(&denied).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::AuthorizationDenied);
    assert_eq!(entries[0].user_id, Some(stranger));
    assert!(!entries[0].success);
    assert_eq!(entries[0].ip_address.as_deref(), Some("192.0.2.10"));

    let missing = again(&as_patient);
    let decision = clinic
        .records
        .authorize(
            &missing,
            medvault_access::DocumentId::generate(),
            Capability::Read,
        )
        .await?;
    assert_eq!(decision, Decision::Deny(DenyReason::NotFound));
    assert_eq!(clinic.entries_for(&missing).await?.len(), 1);

    let anonymous = RequestContext::authenticated(Credentials::bearer("forged"));
    let result = clinic
        .records
        .authorize(&anonymous, document, Capability::Read)
        .await;
    assert!(matches!(result, Err(MedvaultError::Unauthenticated(_))));
    let entries = clinic.entries_for(&anonymous).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::AuthenticationFailed);
    assert_eq!(entries[0].user_id, None);
    Ok(())
}

#[tokio::test]
async fn it_rejects_deactivated_accounts_regardless_of_role() -> TestResult {
    let clinic = Clinic::new();
    let (patient, _) = clinic.enroll(Role::Patient, "a").await?;
    let (doctor, as_doctor) = clinic.enroll(Role::Doctor, "b").await?;
    let (_, as_admin) = clinic.enroll(Role::Admin, "admin").await?;
    let document = clinic.upload(&as_doctor, patient, None, b"plan").await?;

    let view = clinic
        .records
        .set_user_active(&as_admin, doctor, false)
        .await?;
    assert!(!view.is_active);

    for capability in [Capability::Read, Capability::Write, Capability::Admin] {
        let result = clinic
            .records
            .authorize(&again(&as_doctor), document, capability)
            .await;
        assert!(matches!(result, Err(MedvaultError::Unauthenticated(_))));
    }

    let attempt = again(&as_doctor);
    let _ = clinic.records.authorize(&attempt, document, Capability::Read).await;
    let entries = clinic.entries_for(&attempt).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::AuthenticationFailed);
    assert_eq!(entries[0].user_id, Some(doctor));

    clinic
        .records
        .set_user_active(&again(&as_admin), doctor, true)
        .await?;
    assert!(
        clinic
            .records
            .authorize(&again(&as_doctor), document, Capability::Read)
            .await?
            .is_allowed()
    );
    Ok(())
}

#[tokio::test]
async fn it_hides_soft_deleted_documents_from_everyone() -> TestResult {
    let clinic = Clinic::new();
    let (patient, as_patient) = clinic.enroll(Role::Patient, "a").await?;
    let (_, as_doctor) = clinic.enroll(Role::Doctor, "b").await?;
    let (_, as_admin) = clinic.enroll(Role::Admin, "admin").await?;
    let document = clinic.upload(&as_doctor, patient, None, b"old").await?;

    clinic.records.delete_document(&as_doctor, document).await?;

    for context in [&as_patient, &as_doctor, &as_admin] {
        assert_eq!(
            clinic
                .records
                .authorize(&again(context), document, Capability::Read)
                .await?,
            Decision::Deny(DenyReason::NotFound)
        );
    }

    let read = clinic.records.get_document(&again(&as_patient), document).await;
    assert!(matches!(read, Err(MedvaultError::NotFound(_))));

    let deletion_denials = clinic
        .store
        .count::<AuditEntry>(&|entry| {
            entry.action == AuditAction::AuthorizationDenied
                && entry.resource_id == Some(document.to_string())
        })
        .await?;
    assert_eq!(deletion_denials, 4);
    Ok(())
}
