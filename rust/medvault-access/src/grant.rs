//! The delegation ledger: time-bound grants of access to one document.

use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use medvault_common::{Clock, SharedClock};
use medvault_storage::{DocumentStore, Record, StoreError, Versioned};
use serde::{Deserialize, Serialize};

use crate::{DocumentId, GrantId, MedicalDocument, MedvaultError, UserId};

/// How much access is held or requested over a document.
///
/// Levels are ordered `read < write < admin`; a grant at one level covers
/// every capability at or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// View the document and resolve its key
    Read,
    /// Amend the document
    Write,
    /// Delete the document
    Admin,
}

/// The kind of access requested of the authorization engine.
pub type Capability = AccessLevel;

impl AccessLevel {
    /// Whether holding `self` is enough to exercise `requested`.
    pub fn covers(&self, requested: Capability) -> bool {
        *self >= requested
    }

    /// The lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = MedvaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            "admin" => Ok(AccessLevel::Admin),
            other => Err(MedvaultError::Validation(format!(
                "Invalid access level '{other}'. Must be one of: read, write, admin"
            ))),
        }
    }
}

/// A delegation of `access_level` over `document_id` from `grantor_id` to
/// `grantee_id`.
///
/// At most one active grant exists per (grantee, document). Grants are never
/// deleted: revocation flips `is_active` and expiry is evaluated lazily by
/// [AccessGrant::is_effective].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Stable identifier
    pub id: GrantId,
    /// Who delegated access; for admin grants, the patient
    pub grantor_id: UserId,
    /// Who receives access
    pub grantee_id: UserId,
    /// The single document the grant covers
    pub document_id: DocumentId,
    /// The highest capability conferred
    pub access_level: AccessLevel,
    /// No access at or after this instant
    pub expires_at: Option<DateTime<Utc>>,
    /// Cleared on revocation
    pub is_active: bool,
    /// Free text supplied by the grantor
    pub reason: Option<String>,
    /// Who performed the grant; an admin acting for the patient differs from
    /// the grantor
    pub granted_by: UserId,
    /// When the grant was first written
    pub created_at: DateTime<Utc>,
    /// When its terms last changed
    pub updated_at: DateTime<Utc>,
    /// Set on revocation
    pub revoked_at: Option<DateTime<Utc>>,
    /// Who revoked the grant
    pub revoked_by: Option<UserId>,
}

impl AccessGrant {
    /// Whether the grant confers access at `now`: it is active and either
    /// never expires or expires strictly after `now`.
    ///
    /// Every consumer of grants (authorization, listings, statistics) goes
    /// through this predicate.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    fn pair_key(grantee_id: UserId, document_id: DocumentId) -> String {
        format!("grant:{grantee_id}:{document_id}")
    }
}

impl Record for AccessGrant {
    const COLLECTION: &'static str = "access_grants";

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn unique_keys(&self) -> Vec<String> {
        if self.is_active {
            vec![Self::pair_key(self.grantee_id, self.document_id)]
        } else {
            Vec::new()
        }
    }
}

/// The parameters of a grant, as requested by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantRequest {
    /// The document to share
    pub document_id: DocumentId,
    /// Who receives access
    pub grantee_id: UserId,
    /// The highest capability conferred
    pub access_level: AccessLevel,
    /// Must lie in the future when given
    pub expires_at: Option<DateTime<Utc>>,
    /// Free text recorded with the grant
    pub reason: Option<String>,
}

/// The parties recorded on a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grantor {
    /// On whose behalf access is granted
    pub grantor_id: UserId,
    /// Who performed the operation
    pub granted_by: UserId,
}

/// Outcome of a grant upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrantResult {
    /// The grant that now holds the delegation
    pub id: GrantId,
    /// `true` when a new grant was created, `false` when an active one was
    /// updated in place
    pub created: bool,
}

/// What [GrantStore::upsert] wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    /// The grant as now stored
    pub grant: AccessGrant,
    /// The active grant it overwrote, absent when the grant is new
    pub previous: Option<AccessGrant>,
}

impl Upserted {
    /// Whether a new grant was created rather than an active one updated.
    pub fn created(&self) -> bool {
        self.previous.is_none()
    }
}

/// A grant as shown to the parties allowed to list them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantView {
    /// Stable identifier
    pub id: GrantId,
    /// Who delegated access
    pub grantor_id: UserId,
    /// Who receives access
    pub grantee_id: UserId,
    /// The document the grant covers
    pub document_id: DocumentId,
    /// The highest capability conferred
    pub access_level: AccessLevel,
    /// No access at or after this instant
    pub expires_at: Option<DateTime<Utc>>,
    /// Free text supplied by the grantor
    pub reason: Option<String>,
    /// Who performed the grant
    pub granted_by: UserId,
    /// When the grant was first written
    pub created_at: DateTime<Utc>,
    /// When its terms last changed
    pub updated_at: DateTime<Utc>,
}

impl From<AccessGrant> for GrantView {
    fn from(grant: AccessGrant) -> Self {
        Self {
            id: grant.id,
            grantor_id: grant.grantor_id,
            grantee_id: grant.grantee_id,
            document_id: grant.document_id,
            access_level: grant.access_level,
            expires_at: grant.expires_at,
            reason: grant.reason,
            granted_by: grant.granted_by,
            created_at: grant.created_at,
            updated_at: grant.updated_at,
        }
    }
}

/// Persistence of [AccessGrant]s over a [DocumentStore].
///
/// Writes never check-then-insert blindly: inserts rely on the store's unique
/// key for the (grantee, document) pair and updates are edition checked, and
/// a lost race is retried up to `retries` times.
#[derive(Clone)]
pub struct GrantStore<S>
where
    S: DocumentStore,
{
    store: S,
    clock: SharedClock,
    retries: usize,
}

impl<S> GrantStore<S>
where
    S: DocumentStore,
{
    /// Keep grants in `store`, timestamped by `clock`.
    pub fn new(store: S, clock: SharedClock, retries: usize) -> Self {
        Self {
            store,
            clock,
            retries,
        }
    }

    /// The grant with the given id, provided it has not been revoked.
    pub async fn active(&self, id: GrantId) -> Result<Versioned<AccessGrant>, MedvaultError> {
        self.store
            .get::<AccessGrant>(&id.to_string())
            .await?
            .filter(|grant| grant.record.is_active)
            .ok_or_else(|| MedvaultError::NotFound(format!("Access grant {id} not found")))
    }

    async fn active_for(
        &self,
        grantee_id: UserId,
        document_id: DocumentId,
    ) -> Result<Option<Versioned<AccessGrant>>, MedvaultError> {
        Ok(self
            .store
            .find_one::<AccessGrant>(&|grant| {
                grant.is_active
                    && grant.grantee_id == grantee_id
                    && grant.document_id == document_id
            })
            .await?)
    }

    /// The grant through which `grantee_id` currently holds access to
    /// `document_id`, if any.
    pub async fn effective_for(
        &self,
        grantee_id: UserId,
        document_id: DocumentId,
    ) -> Result<Option<AccessGrant>, MedvaultError> {
        let now = self.clock.now();
        Ok(self
            .active_for(grantee_id, document_id)
            .await?
            .map(Versioned::into_record)
            .filter(|grant| grant.is_effective(now)))
    }

    /// Create a grant for (grantee, document), or update the active one in
    /// place: level, expiry and reason are replaced, the parties and the
    /// update time refreshed, and the id kept.
    pub async fn upsert(
        &self,
        parties: Grantor,
        request: &GrantRequest,
    ) -> Result<Upserted, MedvaultError> {
        for attempt in 0..=self.retries {
            let now = self.clock.now();

            let outcome = match self
                .active_for(request.grantee_id, request.document_id)
                .await?
            {
                Some(Versioned { record, edition }) => {
                    let grant = AccessGrant {
                        grantor_id: parties.grantor_id,
                        granted_by: parties.granted_by,
                        access_level: request.access_level,
                        expires_at: request.expires_at,
                        reason: request.reason.clone(),
                        updated_at: now,
                        ..record.clone()
                    };
                    self.store
                        .replace(&grant, edition)
                        .await
                        .map(|_| Upserted {
                            grant,
                            previous: Some(record),
                        })
                }
                None => {
                    let grant = AccessGrant {
                        id: GrantId::generate(),
                        grantor_id: parties.grantor_id,
                        grantee_id: request.grantee_id,
                        document_id: request.document_id,
                        access_level: request.access_level,
                        expires_at: request.expires_at,
                        is_active: true,
                        reason: request.reason.clone(),
                        granted_by: parties.granted_by,
                        created_at: now,
                        updated_at: now,
                        revoked_at: None,
                        revoked_by: None,
                    };
                    self.store.insert(&grant).await.map(|_| Upserted {
                        grant,
                        previous: None,
                    })
                }
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(
                    error @ (StoreError::UniqueViolation { .. }
                    | StoreError::EditionMismatch { .. }
                    | StoreError::Missing { .. }),
                ) => {
                    tracing::debug!(%error, attempt, "grant write lost a race; retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(MedvaultError::Conflict(format!(
            "Grant for user {} on document {} is being modified concurrently",
            request.grantee_id, request.document_id
        )))
    }

    /// Soft-revoke a grant on behalf of `actor`.
    ///
    /// Fails with [MedvaultError::NotFound] when the grant does not exist or
    /// is already inactive, including when a concurrent revocation wins.
    pub async fn revoke(&self, id: GrantId, actor: UserId) -> Result<AccessGrant, MedvaultError> {
        for _ in 0..=self.retries {
            let Versioned { record, edition } = self.active(id).await?;
            let now = self.clock.now();
            let grant = AccessGrant {
                is_active: false,
                revoked_at: Some(now),
                revoked_by: Some(actor),
                updated_at: now,
                ..record
            };

            match self.store.replace(&grant, edition).await {
                Ok(_) => return Ok(grant),
                Err(StoreError::EditionMismatch { .. }) => continue,
                Err(error) => return Err(error.into()),
            }
        }

        Err(MedvaultError::Conflict(format!(
            "Access grant {id} is being modified concurrently"
        )))
    }

    /// Take back what `upserted` wrote: a created grant is revoked by
    /// `actor`, an updated one gets its previous terms back. A grant that
    /// changed again since is left alone.
    pub async fn undo(&self, upserted: &Upserted, actor: UserId) -> Result<(), MedvaultError> {
        let id = upserted.grant.id;
        let Some(Versioned { record, edition }) =
            self.store.get::<AccessGrant>(&id.to_string()).await?
        else {
            return Ok(());
        };
        if record != upserted.grant {
            tracing::debug!(grant_id = %id, "grant changed since the upsert; not undone");
            return Ok(());
        }

        let restored = match &upserted.previous {
            Some(previous) => previous.clone(),
            None => {
                let now = self.clock.now();
                AccessGrant {
                    is_active: false,
                    revoked_at: Some(now),
                    revoked_by: Some(actor),
                    updated_at: now,
                    ..record
                }
            }
        };
        self.store.replace(&restored, edition).await?;
        Ok(())
    }

    /// The grants on `document_id` that currently confer access.
    pub async fn list_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<AccessGrant>, MedvaultError> {
        let now = self.clock.now();
        let mut grants: Vec<AccessGrant> = self
            .store
            .find::<AccessGrant>(&|grant| {
                grant.document_id == document_id && grant.is_effective(now)
            })
            .await?
            .into_iter()
            .map(Versioned::into_record)
            .collect();
        grants.sort_by_key(|grant| std::cmp::Reverse(grant.created_at));
        Ok(grants)
    }

    /// The number of grants, across all documents, that currently confer
    /// access. Grants on soft-deleted documents confer none.
    pub async fn count_effective(&self) -> Result<usize, MedvaultError> {
        let now = self.clock.now();
        let deleted: HashSet<DocumentId> = self
            .store
            .find::<MedicalDocument>(&|document| document.is_deleted)
            .await?
            .into_iter()
            .map(|document| document.record.id)
            .collect();

        Ok(self
            .store
            .count::<AccessGrant>(&|grant| {
                grant.is_effective(now) && !deleted.contains(&grant.document_id)
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use medvault_common::{Clock, ManualClock};
    use medvault_storage::MemoryDocumentStore;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(grantee_id: UserId, document_id: DocumentId, level: AccessLevel) -> GrantRequest {
        GrantRequest {
            document_id,
            grantee_id,
            access_level: level,
            expires_at: None,
            reason: Some("second opinion".into()),
        }
    }

    fn parties(grantor_id: UserId) -> Grantor {
        Grantor {
            grantor_id,
            granted_by: grantor_id,
        }
    }

    #[test]
    fn it_orders_access_levels() {
        assert!(AccessLevel::Admin.covers(AccessLevel::Read));
        assert!(AccessLevel::Write.covers(AccessLevel::Write));
        assert!(!AccessLevel::Read.covers(AccessLevel::Write));
    }

    #[test]
    fn it_treats_expiry_as_exclusive() {
        let now = Utc::now();
        let grant = AccessGrant {
            id: GrantId::generate(),
            grantor_id: UserId::generate(),
            grantee_id: UserId::generate(),
            document_id: DocumentId::generate(),
            access_level: AccessLevel::Read,
            expires_at: Some(now),
            is_active: true,
            reason: None,
            granted_by: UserId::generate(),
            created_at: now,
            updated_at: now,
            revoked_at: None,
            revoked_by: None,
        };

        assert!(grant.is_effective(now - Duration::seconds(1)));
        assert!(!grant.is_effective(now));
        assert!(
            !AccessGrant {
                is_active: false,
                expires_at: None,
                ..grant
            }
            .is_effective(now)
        );
    }

    #[tokio::test]
    async fn it_updates_the_active_grant_instead_of_adding_one() -> anyhow::Result<()> {
        let clock = ManualClock::starting_now();
        let grants = GrantStore::new(<MemoryDocumentStore>::default(), clock.shared(), 3);
        let (grantor, grantee, document) =
            (UserId::generate(), UserId::generate(), DocumentId::generate());

        let first = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Read))
            .await?;
        clock.advance(Duration::minutes(5));
        let updated = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Write))
            .await?;
        let (first, second) = (first.grant, updated.grant.clone());

        assert!(!updated.created());
        assert_eq!(updated.previous, Some(first.clone()));
        assert_eq!(second.id, first.id);
        assert_eq!(second.access_level, AccessLevel::Write);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.updated_at - first.updated_at, Duration::minutes(5));
        assert_eq!(grants.list_for_document(document).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn it_revokes_once() -> anyhow::Result<()> {
        let clock = ManualClock::starting_now();
        let grants = GrantStore::new(<MemoryDocumentStore>::default(), clock.shared(), 3);
        let (grantor, grantee, document) =
            (UserId::generate(), UserId::generate(), DocumentId::generate());
        let grant = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Read))
            .await?
            .grant;

        let revoked = grants.revoke(grant.id, grantor).await?;
        let again = grants.revoke(grant.id, grantor).await;

        assert!(!revoked.is_active);
        assert_eq!(revoked.revoked_by, Some(grantor));
        assert!(matches!(again, Err(MedvaultError::NotFound(_))));
        assert_eq!(grants.effective_for(grantee, document).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn it_creates_a_fresh_grant_after_revocation() -> anyhow::Result<()> {
        let clock = ManualClock::starting_now();
        let grants = GrantStore::new(<MemoryDocumentStore>::default(), clock.shared(), 3);
        let (grantor, grantee, document) =
            (UserId::generate(), UserId::generate(), DocumentId::generate());
        let revoked = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Read))
            .await?
            .grant;
        grants.revoke(revoked.id, grantor).await?;

        let fresh = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Read))
            .await?;

        assert!(fresh.created());
        assert_ne!(fresh.grant.id, revoked.id);
        Ok(())
    }

    #[tokio::test]
    async fn it_hides_expired_grants_from_lookups_and_counts() -> anyhow::Result<()> {
        let clock = ManualClock::starting_now();
        let grants = GrantStore::new(<MemoryDocumentStore>::default(), clock.shared(), 3);
        let (grantor, grantee, document) =
            (UserId::generate(), UserId::generate(), DocumentId::generate());
        let expiring = GrantRequest {
            expires_at: Some(clock.now() + Duration::hours(1)),
            ..request(grantee, document, AccessLevel::Read)
        };
        grants.upsert(parties(grantor), &expiring).await?;

        assert!(grants.effective_for(grantee, document).await?.is_some());
        assert_eq!(grants.count_effective().await?, 1);

        clock.advance(Duration::hours(2));

        assert_eq!(grants.effective_for(grantee, document).await?, None);
        assert_eq!(grants.count_effective().await?, 0);
        assert!(grants.list_for_document(document).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn it_undoes_an_upsert() -> anyhow::Result<()> {
        let clock = ManualClock::starting_now();
        let grants = GrantStore::new(<MemoryDocumentStore>::default(), clock.shared(), 3);
        let (grantor, grantee, document) =
            (UserId::generate(), UserId::generate(), DocumentId::generate());

        let created = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Read))
            .await?;
        grants.undo(&created, grantor).await?;
        assert_eq!(grants.effective_for(grantee, document).await?, None);

        let kept = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Read))
            .await?;
        clock.advance(Duration::minutes(1));
        let raised = grants
            .upsert(parties(grantor), &request(grantee, document, AccessLevel::Admin))
            .await?;
        grants.undo(&raised, grantor).await?;

        assert_eq!(grants.effective_for(grantee, document).await?, Some(kept.grant));
        Ok(())
    }
}
