use medvault_common::{Checksum, Clock, SharedClock};
use medvault_storage::{DocumentStore, Versioned};
use serde::Serialize;

use crate::{
    AccessGrant, AuditAction, AuditEvent, AuditLogger, AuthorizationEngine, Basis, Capability,
    CredentialVerifier, Decision, DocumentId, DocumentRequest, DocumentSummary, DocumentView,
    GrantId, GrantRequest, GrantResult, GrantStore, GrantView, Grantor, KeyManager, KeyMaterial,
    MasterKey, MedicalDocument, MedvaultError, Principal, ProfileDetails, ProfileUpdate,
    RequestContext, ResourceType, Role, Settings, Upload, Upserted, User, UserId, UserView,
};

/// A request to create an account.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    /// Login email; normalized before storage
    pub email: String,
    /// Produced by the credential layer; stored as is
    pub credential_hash: String,
    /// Fixed for the life of the account
    pub role: Role,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
}

/// Active accounts by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UserCounts {
    /// Active doctors
    pub doctors: usize,
    /// Active patients
    pub patients: usize,
    /// Active administrators
    pub admins: usize,
    /// All active accounts
    pub total: usize,
}

/// System-wide counts for administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Active accounts by role
    pub users: UserCounts,
    /// Documents that are not soft-deleted
    pub documents: usize,
    /// Grants that currently confer access
    pub effective_grants: usize,
    /// Entries in the audit log
    pub audit_entries: usize,
}

/// The entry point for callers: every operation authenticates the caller,
/// authorizes it, performs it and records it in the audit log.
///
/// All collaborators are injected; the service keeps no state of its own
/// beyond them.
#[derive(Clone)]
pub struct MedicalRecords<S, V>
where
    S: DocumentStore,
    V: CredentialVerifier,
{
    store: S,
    verifier: V,
    clock: SharedClock,
    settings: Settings,
    audit: AuditLogger<S>,
    grants: GrantStore<S>,
    engine: AuthorizationEngine<S>,
    keys: KeyManager<S>,
}

impl<S, V> MedicalRecords<S, V>
where
    S: DocumentStore,
    V: CredentialVerifier,
{
    /// Wire the service over `store`, wrapping document keys under `master`.
    pub fn new(
        store: S,
        verifier: V,
        clock: SharedClock,
        settings: Settings,
        master: MasterKey,
    ) -> Self {
        let audit = AuditLogger::new(store.clone(), clock.clone(), settings.audit_retention_days);
        let grants = GrantStore::new(store.clone(), clock.clone(), settings.grant_write_retries);
        let engine = AuthorizationEngine::new(store.clone(), grants.clone(), audit.clone());
        let keys = KeyManager::new(
            store.clone(),
            master,
            engine.clone(),
            audit.clone(),
            clock.clone(),
        );

        Self {
            store,
            verifier,
            clock,
            settings,
            audit,
            grants,
            engine,
            keys,
        }
    }

    /// Like [MedicalRecords::new], taking the master key from `settings`.
    pub fn from_settings(
        store: S,
        verifier: V,
        clock: SharedClock,
        settings: Settings,
    ) -> Result<Self, MedvaultError> {
        let master = settings.master_key()?;
        Ok(Self::new(store, verifier, clock, settings, master))
    }

    /// The authorization engine the service decides with.
    pub fn engine(&self) -> &AuthorizationEngine<S> {
        &self.engine
    }

    /// The key manager the service seals documents with.
    pub fn keys(&self) -> &KeyManager<S> {
        &self.keys
    }

    /// The grant ledger.
    pub fn grants(&self) -> &GrantStore<S> {
        &self.grants
    }

    /// Resolve the caller of `context` to an active principal.
    ///
    /// The user is reloaded on every call, so a deactivation takes effect
    /// immediately. Failures are audited as `AUTHENTICATION_FAILED`.
    pub async fn authenticate(&self, context: &RequestContext) -> Result<Principal, MedvaultError> {
        let Some(credentials) = &context.credentials else {
            return self.reject(None, "Missing credentials", context).await;
        };

        let user_id = match self.verifier.verify(credentials).await {
            Ok(user_id) => user_id,
            Err(MedvaultError::Unauthenticated(reason)) => {
                return self.reject(None, reason, context).await;
            }
            Err(error) => return Err(error),
        };

        match self.user(user_id).await? {
            Some(user) if user.is_active => Ok(user.principal()),
            Some(_) => {
                self.reject(Some(user_id), "Account is deactivated", context)
                    .await
            }
            None => self.reject(Some(user_id), "Unknown user", context).await,
        }
    }

    async fn reject(
        &self,
        user_id: Option<UserId>,
        reason: impl Into<String>,
        context: &RequestContext,
    ) -> Result<Principal, MedvaultError> {
        let reason = reason.into();
        tracing::debug!(user_id = ?user_id, %reason, "authentication failed");

        let mut event =
            AuditEvent::new(AuditAction::AuthenticationFailed, ResourceType::User).failed(&reason);
        if let Some(user_id) = user_id {
            event = event.by(user_id).on(user_id);
        }
        self.audit.record(event, context).await?;

        Err(MedvaultError::Unauthenticated(reason))
    }

    async fn finish<T>(
        &self,
        event: AuditEvent,
        result: Result<T, MedvaultError>,
        context: &RequestContext,
    ) -> Result<T, MedvaultError> {
        self.audit.record(event.outcome(&result), context).await?;
        result
    }

    async fn user(&self, id: UserId) -> Result<Option<User>, MedvaultError> {
        Ok(self
            .store
            .get::<User>(&id.to_string())
            .await?
            .map(Versioned::into_record))
    }

    async fn require_user(
        &self,
        id: UserId,
        role: Option<Role>,
        label: &str,
    ) -> Result<User, MedvaultError> {
        self.user(id)
            .await?
            .filter(|user| user.is_active && role.is_none_or(|role| user.role == role))
            .ok_or_else(|| MedvaultError::NotFound(format!("{label} {id} not found")))
    }

    /// Decide whether the caller may exercise `capability` over a document.
    ///
    /// Records exactly one audit entry: the decision, or the failed
    /// authentication.
    pub async fn authorize(
        &self,
        context: &RequestContext,
        document_id: DocumentId,
        capability: Capability,
    ) -> Result<Decision, MedvaultError> {
        let principal = self.authenticate(context).await?;
        self.engine
            .decide(&principal, document_id, capability, context)
            .await
    }

    /// Grant, or re-grant, access to a document.
    ///
    /// The patient owner, the authoring doctor and administrators may grant.
    /// An administrator grants on the patient's behalf: the patient is
    /// recorded as grantor and the administrator as `granted_by`.
    ///
    /// When the grant is written but its audit entry is not, the write is
    /// undone before the error is returned.
    pub async fn grant_access(
        &self,
        context: &RequestContext,
        request: GrantRequest,
    ) -> Result<GrantResult, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let upserted = self.upsert_grant(&principal, &request, context).await;

        let action = match &upserted {
            Ok(upserted) if !upserted.created() => AuditAction::AccessGrantUpdated,
            _ => AuditAction::AccessGranted,
        };
        let mut event = AuditEvent::new(action, ResourceType::AccessGrant)
            .by(principal.id)
            .detail("document_id", request.document_id)
            .detail("grantee_id", request.grantee_id)
            .detail("access_level", request.access_level);
        if let Ok(upserted) = &upserted {
            event = event.on(upserted.grant.id);
        }
        if let Some(expires_at) = request.expires_at {
            event = event.detail("expires_at", expires_at.to_rfc3339());
        }

        let upserted = match upserted {
            Ok(upserted) => upserted,
            Err(error) => return self.finish(event, Err(error), context).await,
        };
        if let Err(error) = self.audit.record(event, context).await {
            if let Err(undo) = self.grants.undo(&upserted, principal.id).await {
                tracing::error!(grant_id = %upserted.grant.id, %undo, "failed to undo unaudited grant");
            }
            return Err(error);
        }

        Ok(GrantResult {
            id: upserted.grant.id,
            created: upserted.created(),
        })
    }

    async fn upsert_grant(
        &self,
        principal: &Principal,
        request: &GrantRequest,
        context: &RequestContext,
    ) -> Result<Upserted, MedvaultError> {
        if let Some(expires_at) = request.expires_at {
            if expires_at <= self.clock.now() {
                return Err(MedvaultError::Validation(
                    "Expiry must be in the future".into(),
                ));
            }
        }

        let (basis, document) = self
            .engine
            .authorize_document(
                principal,
                request.document_id,
                DocumentRequest::Delegate,
                context,
            )
            .await?;

        self.require_user(request.grantee_id, None, "Grantee")
            .await?;

        let parties = match basis {
            Basis::Administrator => Grantor {
                grantor_id: document.record.patient_id,
                granted_by: principal.id,
            },
            _ => Grantor {
                grantor_id: principal.id,
                granted_by: principal.id,
            },
        };
        self.grants.upsert(parties, request).await
    }

    /// Soft-revoke a grant. Its grantor, its grantee and administrators may.
    pub async fn revoke_access(
        &self,
        context: &RequestContext,
        grant_id: GrantId,
    ) -> Result<(), MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.revoke_grant(&principal, grant_id, context).await;

        let mut event = AuditEvent::new(AuditAction::AccessRevoked, ResourceType::AccessGrant)
            .by(principal.id)
            .on(grant_id);
        if let Ok(grant) = &result {
            event = event
                .detail("document_id", grant.document_id)
                .detail("grantee_id", grant.grantee_id)
                .detail("access_level", grant.access_level);
        }

        self.finish(event, result.map(|_| ()), context).await
    }

    async fn revoke_grant(
        &self,
        principal: &Principal,
        grant_id: GrantId,
        context: &RequestContext,
    ) -> Result<AccessGrant, MedvaultError> {
        let grant = self.grants.active(grant_id).await?.into_record();
        self.engine
            .authorize_revocation(principal, &grant, context)
            .await?;
        self.grants.revoke(grant_id, principal.id).await
    }

    /// The grants currently in effect on a document, for the parties who
    /// may grant on it.
    pub async fn list_grants(
        &self,
        context: &RequestContext,
        document_id: DocumentId,
    ) -> Result<Vec<GrantView>, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.document_grants(&principal, document_id, context).await;

        let mut event = AuditEvent::new(AuditAction::AccessGrantsListed, ResourceType::MedicalDocument)
            .by(principal.id)
            .on(document_id);
        if let Ok(grants) = &result {
            event = event.detail("count", grants.len());
        }

        self.finish(event, result, context).await
    }

    async fn document_grants(
        &self,
        principal: &Principal,
        document_id: DocumentId,
        context: &RequestContext,
    ) -> Result<Vec<GrantView>, MedvaultError> {
        self.engine
            .authorize_document(principal, document_id, DocumentRequest::Delegate, context)
            .await?;

        Ok(self
            .grants
            .list_for_document(document_id)
            .await?
            .into_iter()
            .map(GrantView::from)
            .collect())
    }

    /// Release the data key of a document to a caller who may read it.
    pub async fn resolve_document_key(
        &self,
        context: &RequestContext,
        document_id: DocumentId,
    ) -> Result<KeyMaterial, MedvaultError> {
        let principal = self.authenticate(context).await?;

        let handle = match self.keys.active_key(document_id).await {
            Ok(handle) => handle,
            Err(error) => {
                let event =
                    AuditEvent::new(AuditAction::KeyReleaseDenied, ResourceType::MedicalDocument)
                        .by(principal.id)
                        .on(document_id);
                return self.finish(event, Err(error), context).await;
            }
        };

        self.keys
            .resolve_key(handle.key_id, &principal, context)
            .await
    }

    /// Create an account. The role chosen here can never change.
    pub async fn register_user(
        &self,
        context: &RequestContext,
        registration: Registration,
    ) -> Result<UserView, MedvaultError> {
        let result = self.create_user(&registration).await;

        let mut event = AuditEvent::new(AuditAction::UserRegistered, ResourceType::User)
            .detail("email", User::normalized_email(&registration.email))
            .detail("role", registration.role);
        if let Ok(user) = &result {
            event = event.by(user.id).on(user.id);
        }

        self.finish(event, result, context).await
    }

    async fn create_user(&self, registration: &Registration) -> Result<UserView, MedvaultError> {
        let email = User::normalized_email(&registration.email);
        if email.is_empty() || !email.contains('@') {
            return Err(MedvaultError::Validation("A valid email is required".into()));
        }
        if registration.credential_hash.is_empty() {
            return Err(MedvaultError::Validation("Credentials are required".into()));
        }
        let (first_name, last_name) = (
            registration.first_name.trim(),
            registration.last_name.trim(),
        );
        if first_name.is_empty() || last_name.is_empty() {
            return Err(MedvaultError::Validation(
                "First and last name are required".into(),
            ));
        }

        let taken = self
            .store
            .find_one::<User>(&|user| User::normalized_email(&user.email) == email)
            .await?;
        if taken.is_some() {
            return Err(MedvaultError::Conflict("Email already registered".into()));
        }

        let now = self.clock.now();
        let user = User {
            id: UserId::generate(),
            email: email.clone(),
            credential_hash: registration.credential_hash.clone(),
            role: registration.role,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            is_active: true,
            mfa_secret: None,
            details: ProfileDetails::default(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&user).await?;

        Ok(UserView::from(&user))
    }

    /// Activate or deactivate an account. Administrators only, and never
    /// their own account.
    pub async fn set_user_active(
        &self,
        context: &RequestContext,
        user_id: UserId,
        active: bool,
    ) -> Result<UserView, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self
            .change_status(&principal, user_id, active, context)
            .await;

        let event = AuditEvent::new(AuditAction::UserStatusChanged, ResourceType::User)
            .by(principal.id)
            .on(user_id)
            .detail("is_active", active);

        self.finish(event, result, context).await
    }

    async fn change_status(
        &self,
        principal: &Principal,
        user_id: UserId,
        active: bool,
        context: &RequestContext,
    ) -> Result<UserView, MedvaultError> {
        self.engine
            .authorize_administration(principal, context)
            .await?;

        if user_id == principal.id && !active {
            return Err(MedvaultError::Validation(
                "Cannot deactivate your own account".into(),
            ));
        }

        let Versioned { record, edition } = self
            .store
            .get::<User>(&user_id.to_string())
            .await?
            .ok_or_else(|| MedvaultError::NotFound(format!("User {user_id} not found")))?;
        let user = User {
            is_active: active,
            updated_at: self.clock.now(),
            ..record
        };
        self.store.replace(&user, edition).await?;

        Ok(UserView::from(&user))
    }

    /// Active accounts, newest first, optionally only those of `role`.
    /// Administrators only.
    pub async fn list_users(
        &self,
        context: &RequestContext,
        role: Option<Role>,
    ) -> Result<Vec<UserView>, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.active_users(&principal, role, context).await;

        let mut event = AuditEvent::new(AuditAction::UsersListed, ResourceType::User)
            .by(principal.id)
            .on("multiple")
            .detail("role_filter", role.map_or("all", |role| role.as_str()));
        if let Ok(users) = &result {
            event = event.detail("count", users.len());
        }

        self.finish(event, result, context).await
    }

    async fn active_users(
        &self,
        principal: &Principal,
        role: Option<Role>,
        context: &RequestContext,
    ) -> Result<Vec<UserView>, MedvaultError> {
        self.engine
            .authorize_administration(principal, context)
            .await?;

        let mut users: Vec<User> = self
            .store
            .find::<User>(&|user| user.is_active && role.is_none_or(|role| user.role == role))
            .await?
            .into_iter()
            .map(Versioned::into_record)
            .collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(users.iter().map(UserView::from).collect())
    }

    /// One account, active or not. Administrators only.
    pub async fn get_user(
        &self,
        context: &RequestContext,
        user_id: UserId,
    ) -> Result<UserView, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.account(&principal, user_id, context).await;

        let event = AuditEvent::new(AuditAction::UserViewed, ResourceType::User)
            .by(principal.id)
            .on(user_id);

        self.finish(event, result, context).await
    }

    async fn account(
        &self,
        principal: &Principal,
        user_id: UserId,
        context: &RequestContext,
    ) -> Result<UserView, MedvaultError> {
        self.engine
            .authorize_administration(principal, context)
            .await?;

        self.user(user_id)
            .await?
            .map(|user| UserView::from(&user))
            .ok_or_else(|| MedvaultError::NotFound(format!("User {user_id} not found")))
    }

    /// The caller's own account.
    pub async fn get_profile(&self, context: &RequestContext) -> Result<UserView, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self
            .require_user(principal.id, None, "User")
            .await
            .map(|user| UserView::from(&user));

        let event = AuditEvent::new(AuditAction::ProfileViewed, ResourceType::User)
            .by(principal.id)
            .on(principal.id);

        self.finish(event, result, context).await
    }

    /// Change the caller's own names and the fields their role carries.
    /// Every caller may edit their own profile and nobody else's; the role
    /// and email are never touched.
    pub async fn update_profile(
        &self,
        context: &RequestContext,
        update: ProfileUpdate,
    ) -> Result<UserView, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.change_profile(principal.id, &update).await;

        let mut event = AuditEvent::new(AuditAction::ProfileUpdated, ResourceType::User)
            .by(principal.id)
            .on(principal.id);
        if let Ok((_, updated)) = &result {
            event = event.detail("updated_fields", updated.join(","));
        }

        self.finish(event, result.map(|(view, _)| view), context)
            .await
    }

    async fn change_profile(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> Result<(UserView, Vec<&'static str>), MedvaultError> {
        let Versioned { mut record, edition } = self
            .store
            .get::<User>(&user_id.to_string())
            .await?
            .ok_or_else(|| MedvaultError::NotFound(format!("User {user_id} not found")))?;

        let updated = record.apply_profile(update)?;
        record.updated_at = self.clock.now();
        self.store.replace(&record, edition).await?;

        Ok((UserView::from(&record), updated))
    }

    /// Store a new document, sealed under a freshly issued data key.
    ///
    /// Doctors upload for an active patient and author the document. Patients
    /// upload their own records and name an active authoring doctor.
    /// Administrators do not upload.
    pub async fn upload_document(
        &self,
        context: &RequestContext,
        upload: Upload,
    ) -> Result<DocumentSummary, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.store_document(&principal, &upload, context).await;

        let mut event = AuditEvent::new(AuditAction::DocumentUploaded, ResourceType::MedicalDocument)
            .by(principal.id)
            .detail("patient_id", upload.patient_id)
            .detail("document_type", upload.document_type)
            .detail("content_length", upload.content.len());
        if let Ok(document) = &result {
            event = event.on(document.id);
        }

        self.finish(event, result, context).await
    }

    async fn store_document(
        &self,
        principal: &Principal,
        upload: &Upload,
        context: &RequestContext,
    ) -> Result<DocumentSummary, MedvaultError> {
        if upload.content.is_empty() {
            return Err(MedvaultError::Validation("Content is required".into()));
        }
        if upload.content.len() > self.settings.max_content_length {
            return Err(MedvaultError::Validation(format!(
                "Content exceeds the maximum of {} bytes",
                self.settings.max_content_length
            )));
        }
        let title = upload.title.trim();
        if title.is_empty() {
            return Err(MedvaultError::Validation("Title is required".into()));
        }

        let (patient_id, doctor_id) = match principal.role {
            Role::Doctor => {
                if upload.doctor_id.is_some_and(|doctor_id| doctor_id != principal.id) {
                    return Err(MedvaultError::Forbidden(
                        "Doctors can only upload documents they author".into(),
                    ));
                }
                (upload.patient_id, principal.id)
            }
            Role::Patient => {
                if upload.patient_id != principal.id {
                    return Err(MedvaultError::Forbidden(
                        "Patients can only upload their own records".into(),
                    ));
                }
                let doctor_id = upload.doctor_id.ok_or_else(|| {
                    MedvaultError::Validation("The authoring doctor is required".into())
                })?;
                (principal.id, doctor_id)
            }
            Role::Admin => {
                return Err(MedvaultError::Forbidden(
                    "Administrators cannot upload medical documents".into(),
                ));
            }
        };
        self.require_user(patient_id, Some(Role::Patient), "Patient")
            .await?;
        self.require_user(doctor_id, Some(Role::Doctor), "Doctor")
            .await?;

        let document_id = DocumentId::generate();
        let (handle, material) = self.keys.issue(document_id, principal.id, context).await?;

        let sealed = material.seal(&upload.content);
        let now = self.clock.now();
        let stored = match sealed {
            Ok(sealed_content) => {
                let document = MedicalDocument {
                    id: document_id,
                    patient_id,
                    doctor_id,
                    document_type: upload.document_type,
                    title: title.to_string(),
                    description: upload.description.clone(),
                    mime_type: if upload.mime_type.is_empty() {
                        "application/octet-stream".to_string()
                    } else {
                        upload.mime_type.clone()
                    },
                    content_length: upload.content.len(),
                    checksum: Checksum::of(&sealed_content),
                    sealed_content,
                    encryption_key_id: handle.key_id,
                    is_deleted: false,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                    deleted_by: None,
                };
                match self.store.insert(&document).await {
                    Ok(_) => Ok(document),
                    Err(error) => Err(error.into()),
                }
            }
            Err(error) => Err(error),
        };

        match stored {
            Ok(document) => Ok(DocumentSummary::from(&document)),
            Err(error) => {
                if let Err(cleanup) = self.keys.deactivate(document_id).await {
                    tracing::error!(%document_id, %cleanup, "failed to retire key of unstored document");
                }
                Err(error)
            }
        }
    }

    /// Read a document: the sealed blob and its key id, never the key.
    ///
    /// A checksum mismatch fails the read and is audited as
    /// `DOCUMENT_INTEGRITY_FAILED`.
    pub async fn get_document(
        &self,
        context: &RequestContext,
        document_id: DocumentId,
    ) -> Result<DocumentView, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.read_document(&principal, document_id, context).await;

        let event = AuditEvent::new(AuditAction::DocumentViewed, ResourceType::MedicalDocument)
            .by(principal.id)
            .on(document_id);

        self.finish(event, result, context).await
    }

    async fn read_document(
        &self,
        principal: &Principal,
        document_id: DocumentId,
        context: &RequestContext,
    ) -> Result<DocumentView, MedvaultError> {
        let (_, document) = self
            .engine
            .authorize_document(
                principal,
                document_id,
                DocumentRequest::Access(Capability::Read),
                context,
            )
            .await?;
        let document = document.into_record();

        if !document.is_intact() {
            tracing::error!(%document_id, "stored content does not match its checksum");
            let error =
                MedvaultError::Internal(format!("Medical document {document_id} failed its integrity check"));
            self.audit
                .record(
                    AuditEvent::new(
                        AuditAction::DocumentIntegrityFailed,
                        ResourceType::MedicalDocument,
                    )
                    .by(principal.id)
                    .on(document_id)
                    .failed(error.to_string()),
                    context,
                )
                .await?;
            return Err(error);
        }

        Ok(DocumentView::from(document))
    }

    /// The live documents about a patient, newest first.
    pub async fn list_patient_documents(
        &self,
        context: &RequestContext,
        patient_id: UserId,
    ) -> Result<Vec<DocumentSummary>, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self
            .patient_documents(&principal, patient_id, context)
            .await;

        let mut event = AuditEvent::new(AuditAction::PatientRecordsListed, ResourceType::Patient)
            .by(principal.id)
            .on(patient_id);
        if let Ok(documents) = &result {
            event = event.detail("count", documents.len());
        }

        self.finish(event, result, context).await
    }

    async fn patient_documents(
        &self,
        principal: &Principal,
        patient_id: UserId,
        context: &RequestContext,
    ) -> Result<Vec<DocumentSummary>, MedvaultError> {
        let patient = self.user(patient_id).await?;
        if !patient.is_some_and(|user| user.role == Role::Patient) {
            return Err(MedvaultError::NotFound(format!(
                "Patient {patient_id} not found"
            )));
        }

        self.engine
            .authorize_patient_listing(principal, patient_id, context)
            .await?;

        let mut documents: Vec<MedicalDocument> = self
            .store
            .find::<MedicalDocument>(&|document| {
                document.patient_id == patient_id && !document.is_deleted
            })
            .await?
            .into_iter()
            .map(Versioned::into_record)
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(documents.iter().map(DocumentSummary::from).collect())
    }

    /// The active patients, by family name then given name. Doctors and
    /// administrators only; reading their documents is authorized
    /// separately.
    pub async fn list_patients(
        &self,
        context: &RequestContext,
    ) -> Result<Vec<UserView>, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.patient_directory(&principal, context).await;

        let mut event = AuditEvent::new(AuditAction::PatientsListed, ResourceType::Patient)
            .by(principal.id)
            .on("multiple");
        if let Ok(patients) = &result {
            event = event.detail("count", patients.len());
        }

        self.finish(event, result, context).await
    }

    async fn patient_directory(
        &self,
        principal: &Principal,
        context: &RequestContext,
    ) -> Result<Vec<UserView>, MedvaultError> {
        self.engine.authorize_directory(principal, context).await?;

        let mut patients: Vec<User> = self
            .store
            .find::<User>(&|user| user.is_active && user.role == Role::Patient)
            .await?
            .into_iter()
            .map(Versioned::into_record)
            .collect();
        patients.sort_by(|a, b| {
            a.last_name
                .cmp(&b.last_name)
                .then_with(|| a.first_name.cmp(&b.first_name))
                .then(a.id.cmp(&b.id))
        });

        Ok(patients.iter().map(UserView::from).collect())
    }

    /// One active patient's directory entry. Doctors and administrators
    /// only.
    pub async fn get_patient(
        &self,
        context: &RequestContext,
        patient_id: UserId,
    ) -> Result<UserView, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.directory_entry(&principal, patient_id, context).await;

        let event = AuditEvent::new(AuditAction::PatientViewed, ResourceType::Patient)
            .by(principal.id)
            .on(patient_id);

        self.finish(event, result, context).await
    }

    async fn directory_entry(
        &self,
        principal: &Principal,
        patient_id: UserId,
        context: &RequestContext,
    ) -> Result<UserView, MedvaultError> {
        self.engine.authorize_directory(principal, context).await?;

        self.require_user(patient_id, Some(Role::Patient), "Patient")
            .await
            .map(|user| UserView::from(&user))
    }

    /// Soft-delete a document and retire its key. Requires the `admin`
    /// capability on the document.
    pub async fn delete_document(
        &self,
        context: &RequestContext,
        document_id: DocumentId,
    ) -> Result<(), MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.remove_document(&principal, document_id, context).await;

        let event = AuditEvent::new(AuditAction::DocumentDeleted, ResourceType::MedicalDocument)
            .by(principal.id)
            .on(document_id);

        self.finish(event, result, context).await
    }

    async fn remove_document(
        &self,
        principal: &Principal,
        document_id: DocumentId,
        context: &RequestContext,
    ) -> Result<(), MedvaultError> {
        let (_, Versioned { record, edition }) = self
            .engine
            .authorize_document(
                principal,
                document_id,
                DocumentRequest::Access(Capability::Admin),
                context,
            )
            .await?;

        let now = self.clock.now();
        let deleted = MedicalDocument {
            is_deleted: true,
            deleted_at: Some(now),
            deleted_by: Some(principal.id),
            updated_at: now,
            ..record
        };
        self.store.replace(&deleted, edition).await?;
        self.keys.deactivate(document_id).await
    }

    /// System-wide counts. Administrators only.
    pub async fn statistics(&self, context: &RequestContext) -> Result<Statistics, MedvaultError> {
        let principal = self.authenticate(context).await?;
        let result = self.gather_statistics(&principal, context).await;

        let event = AuditEvent::new(AuditAction::StatisticsViewed, ResourceType::System)
            .by(principal.id)
            .on("system");

        self.finish(event, result, context).await
    }

    async fn gather_statistics(
        &self,
        principal: &Principal,
        context: &RequestContext,
    ) -> Result<Statistics, MedvaultError> {
        self.engine
            .authorize_administration(principal, context)
            .await?;

        let mut users = UserCounts::default();
        for user in self.store.find::<User>(&|user| user.is_active).await? {
            match user.record.role {
                Role::Doctor => users.doctors += 1,
                Role::Patient => users.patients += 1,
                Role::Admin => users.admins += 1,
            }
            users.total += 1;
        }

        Ok(Statistics {
            users,
            documents: self
                .store
                .count::<MedicalDocument>(&|document| !document.is_deleted)
                .await?,
            effective_grants: self.grants.count_effective().await?,
            audit_entries: self.audit.report().total().await?,
        })
    }
}
