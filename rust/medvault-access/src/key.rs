//! Per-document data keys under envelope encryption.
//!
//! Each document gets its own ChaCha20-Poly1305 data key. The store only
//! ever sees that key wrapped under the [MasterKey], which lives in the
//! [KeyManager]'s memory and nowhere else.

use std::{fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use chrono::{DateTime, Utc};
use medvault_common::{Clock, SharedClock};
use medvault_storage::{DocumentStore, Record, Versioned};
use serde::{Deserialize, Serialize};

use crate::{
    AuditAction, AuditEvent, AuditLogger, AuthorizationEngine, Capability, DocumentId, KeyId,
    MedvaultError, Principal, RequestContext, ResourceType, UserId,
};

/// Algorithm tag recorded on every [EncryptionKey].
pub const ALGORITHM: &str = "CHACHA20-POLY1305";

/// Size of a data or master key in bytes.
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

fn seal(key: &Key, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, MedvaultError> {
    let cipher = ChaCha20Poly1305::new(key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| MedvaultError::Internal("Encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(key: &Key, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, MedvaultError> {
    if sealed.len() < NONCE_SIZE {
        return Err(MedvaultError::Internal("Sealed data is truncated".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    ChaCha20Poly1305::new(key)
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| MedvaultError::Internal("Decryption failed".into()))
}

/// The root key that data keys are wrapped under.
#[derive(Clone)]
pub struct MasterKey(Key);

impl MasterKey {
    /// A fresh random master key. Keys wrapped under it are unrecoverable
    /// once it is dropped.
    pub fn generate() -> Self {
        Self(ChaCha20Poly1305::generate_key(&mut OsRng))
    }

    /// Use the given key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Key::from(bytes))
    }

    /// Decode a standard base64 encoded 32 byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, MedvaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|error| MedvaultError::Validation(format!("Invalid master key: {error}")))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            MedvaultError::Validation(format!(
                "Master key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Stored metadata of a document's data key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Stable identifier
    pub id: KeyId,
    /// The document the key seals
    pub document_id: DocumentId,
    /// The user whose upload generated the key
    pub owner_id: UserId,
    /// Cipher the key is for
    pub algorithm: String,
    /// `nonce || ciphertext` of the data key under the master key
    #[serde(with = "serde_bytes")]
    pub wrapped_key: Vec<u8>,
    /// Cleared when the document is deleted
    pub is_active: bool,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Set on deactivation
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl EncryptionKey {
    fn wrapping_aad(key_id: KeyId, document_id: DocumentId) -> Vec<u8> {
        format!("{key_id}:{document_id}").into_bytes()
    }
}

impl Record for EncryptionKey {
    const COLLECTION: &'static str = "encryption_keys";

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn unique_keys(&self) -> Vec<String> {
        if self.is_active {
            vec![format!("document:{}", self.document_id)]
        } else {
            Vec::new()
        }
    }
}

/// Names a data key without carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyHandle {
    /// Stable identifier of the key
    pub key_id: KeyId,
    /// The document the key seals
    pub document_id: DocumentId,
    /// Cipher the key is for
    pub algorithm: &'static str,
}

/// A released data key.
///
/// Only [KeyManager::resolve_key] hands these out, after an authorization
/// check. The key bytes never show up in `Debug` output.
#[derive(Clone)]
pub struct KeyMaterial {
    key_id: KeyId,
    document_id: DocumentId,
    key: Key,
}

impl KeyMaterial {
    /// Which key this is.
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// The document the key protects.
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// The raw key, for callers decrypting on their side.
    pub fn expose(&self) -> &[u8] {
        self.key.as_slice()
    }

    /// Seal document content under this key, bound to the document id.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, MedvaultError> {
        seal(&self.key, plaintext, self.document_id.to_string().as_bytes())
    }

    /// Open content produced by [KeyMaterial::seal].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, MedvaultError> {
        open(&self.key, sealed, self.document_id.to_string().as_bytes())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("document_id", &self.document_id)
            .finish_non_exhaustive()
    }
}

/// Issues, releases and retires document data keys.
#[derive(Clone)]
pub struct KeyManager<S>
where
    S: DocumentStore,
{
    store: S,
    master: Arc<MasterKey>,
    engine: AuthorizationEngine<S>,
    audit: AuditLogger<S>,
    clock: SharedClock,
}

impl<S> KeyManager<S>
where
    S: DocumentStore,
{
    /// Keep wrapped keys in `store`, releasing them only when `engine`
    /// allows reading the document.
    pub fn new(
        store: S,
        master: MasterKey,
        engine: AuthorizationEngine<S>,
        audit: AuditLogger<S>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            master: Arc::new(master),
            engine,
            audit,
            clock,
        }
    }

    /// Generate the data key of a new document. Fails with
    /// [MedvaultError::Conflict] when the document already has an active key.
    pub async fn issue_key(
        &self,
        document_id: DocumentId,
        owner_id: UserId,
        context: &RequestContext,
    ) -> Result<KeyHandle, MedvaultError> {
        self.issue(document_id, owner_id, context)
            .await
            .map(|(handle, _)| handle)
    }

    pub(crate) async fn issue(
        &self,
        document_id: DocumentId,
        owner_id: UserId,
        context: &RequestContext,
    ) -> Result<(KeyHandle, KeyMaterial), MedvaultError> {
        if self.active_record(document_id).await?.is_some() {
            return Err(MedvaultError::Conflict(format!(
                "Medical document {document_id} already has an active key"
            )));
        }

        let key_id = KeyId::generate();
        let material = KeyMaterial {
            key_id,
            document_id,
            key: ChaCha20Poly1305::generate_key(&mut OsRng),
        };
        let record = EncryptionKey {
            id: key_id,
            document_id,
            owner_id,
            algorithm: ALGORITHM.to_string(),
            wrapped_key: seal(
                &self.master.0,
                material.key.as_slice(),
                &EncryptionKey::wrapping_aad(key_id, document_id),
            )?,
            is_active: true,
            created_at: self.clock.now(),
            deactivated_at: None,
        };
        self.store.insert(&record).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::KeyIssued, ResourceType::EncryptionKey)
                    .by(owner_id)
                    .on(key_id)
                    .detail("document_id", document_id)
                    .detail("algorithm", ALGORITHM),
                context,
            )
            .await?;

        Ok((
            KeyHandle {
                key_id,
                document_id,
                algorithm: ALGORITHM,
            },
            material,
        ))
    }

    async fn active_record(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<Versioned<EncryptionKey>>, MedvaultError> {
        Ok(self
            .store
            .find_one::<EncryptionKey>(&|key| key.is_active && key.document_id == document_id)
            .await?)
    }

    /// The active key of a document.
    pub async fn active_key(&self, document_id: DocumentId) -> Result<KeyHandle, MedvaultError> {
        self.active_record(document_id)
            .await?
            .map(|key| KeyHandle {
                key_id: key.record.id,
                document_id,
                algorithm: ALGORITHM,
            })
            .ok_or_else(|| {
                MedvaultError::NotFound(format!("No active key for medical document {document_id}"))
            })
    }

    /// Release a data key to `requester`, provided they may read the
    /// document it protects.
    pub async fn resolve_key(
        &self,
        key_id: KeyId,
        requester: &Principal,
        context: &RequestContext,
    ) -> Result<KeyMaterial, MedvaultError> {
        let result = self.release(key_id, requester, context).await;

        let event = AuditEvent::new(
            if result.is_ok() {
                AuditAction::KeyReleased
            } else {
                AuditAction::KeyReleaseDenied
            },
            ResourceType::EncryptionKey,
        )
        .by(requester.id)
        .on(key_id)
        .outcome(&result);
        self.audit.record(event, context).await?;

        result
    }

    async fn release(
        &self,
        key_id: KeyId,
        requester: &Principal,
        context: &RequestContext,
    ) -> Result<KeyMaterial, MedvaultError> {
        let record = self
            .store
            .get::<EncryptionKey>(&key_id.to_string())
            .await?
            .map(Versioned::into_record)
            .filter(|key| key.is_active)
            .ok_or_else(|| MedvaultError::NotFound(format!("Encryption key {key_id} not found")))?;

        self.engine
            .decide(requester, record.document_id, Capability::Read, context)
            .await?
            .into_result(&format!("Encryption key {key_id}"))?;

        self.unwrap_key(&record)
    }

    fn unwrap_key(&self, record: &EncryptionKey) -> Result<KeyMaterial, MedvaultError> {
        let bytes = open(
            &self.master.0,
            &record.wrapped_key,
            &EncryptionKey::wrapping_aad(record.id, record.document_id),
        )?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            MedvaultError::Internal(format!("Encryption key {} is malformed", record.id))
        })?;

        Ok(KeyMaterial {
            key_id: record.id,
            document_id: record.document_id,
            key: Key::from(bytes),
        })
    }

    /// Retire the active key of a document, if it has one.
    pub async fn deactivate(&self, document_id: DocumentId) -> Result<(), MedvaultError> {
        let Some(Versioned { record, edition }) = self.active_record(document_id).await? else {
            return Ok(());
        };
        let retired = EncryptionKey {
            is_active: false,
            deactivated_at: Some(self.clock.now()),
            ..record
        };
        self.store.replace(&retired, edition).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_opens_what_it_sealed_and_nothing_else() -> anyhow::Result<()> {
        let material = KeyMaterial {
            key_id: KeyId::generate(),
            document_id: DocumentId::generate(),
            key: ChaCha20Poly1305::generate_key(&mut OsRng),
        };
        let other = KeyMaterial {
            document_id: DocumentId::generate(),
            ..material.clone()
        };

        let sealed = material.seal(b"blood panel")?;

        assert_eq!(material.open(&sealed)?, b"blood panel");
        assert_ne!(&sealed[NONCE_SIZE..], b"blood panel".as_slice());
        assert!(other.open(&sealed).is_err());
        Ok(())
    }

    #[test]
    fn it_validates_master_keys() {
        let valid = STANDARD.encode([7u8; KEY_SIZE]);
        let short = STANDARD.encode([7u8; 16]);

        assert!(MasterKey::from_base64(&valid).is_ok());
        assert!(matches!(
            MasterKey::from_base64(&short),
            Err(MedvaultError::Validation(_))
        ));
        assert!(MasterKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn it_keeps_key_bytes_out_of_debug_output() {
        let master = MasterKey::from_bytes([0xAB; KEY_SIZE]);

        assert_eq!(format!("{master:?}"), "MasterKey(..)");
        assert!(!format!("{master:?}").contains("171"));
    }
}
