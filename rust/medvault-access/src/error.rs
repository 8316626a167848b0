//! Error types for the medical records core.
//!
//! [MedvaultError] is what every operation returns. A framework layer turns
//! it into a [ServiceError], whose [ErrorCode] maps to an HTTP status code
//! via [`ErrorCode::status_code`].

use chrono::{DateTime, Utc};
use medvault_storage::StoreError;
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

/// The error taxonomy shared by every operation of this crate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MedvaultError {
    /// The caller presented no identity, an invalid one, or one belonging to
    /// a deactivated account
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// The caller is known but may not perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The resource is absent, inactive or soft-deleted
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique field is already taken, or a concurrent write won
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Input was malformed or missing
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The store, the audit log or a cryptographic dependency failed
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MedvaultError {
    /// The stable machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            MedvaultError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            MedvaultError::Forbidden(_) => ErrorCode::Forbidden,
            MedvaultError::NotFound(_) => ErrorCode::NotFound,
            MedvaultError::Conflict(_) => ErrorCode::Conflict,
            MedvaultError::Validation(_) => ErrorCode::ValidationError,
            MedvaultError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<StoreError> for MedvaultError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UniqueViolation { collection, key } => {
                MedvaultError::Conflict(format!("'{key}' is already taken in {collection}"))
            }
            StoreError::DuplicateId { collection, id } => {
                MedvaultError::Conflict(format!("{id} already exists in {collection}"))
            }
            StoreError::EditionMismatch { collection, id, .. } => {
                MedvaultError::Conflict(format!("{id} in {collection} was modified concurrently"))
            }
            StoreError::Missing { collection, id } => {
                MedvaultError::NotFound(format!("{id} does not exist in {collection}"))
            }
            error @ (StoreError::EncodeFailed(_)
            | StoreError::DecodeFailed(_)
            | StoreError::Backend(_)) => {
                tracing::error!(%error, "document store failure");
                MedvaultError::Internal(error.to_string())
            }
        }
    }
}

/// Error codes returned to callers.
///
/// Each code maps to an HTTP status code via [`ErrorCode::status_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or missing input
    ValidationError,
    /// No valid identity
    Unauthenticated,
    /// Capability denied
    Forbidden,
    /// Resource absent or soft-deleted
    NotFound,
    /// Duplicate unique field or lost race
    Conflict,
    /// Store or dependency failure
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::InternalError => 500,
        }
    }
}

/// Service error with code, message and the time it was raised.
///
/// This is the externally visible shape of a [MedvaultError]; framework
/// specific code renders it into a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceError {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// When the error was raised
    pub timestamp: DateTime<Utc>,
    /// The request that failed, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Ulid>,
}

impl ServiceError {
    /// Create a new service error.
    pub fn new(code: ErrorCode, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp,
            request_id: None,
        }
    }

    /// Wrap a [MedvaultError] raised at `timestamp` while serving `request_id`.
    pub fn from_error(
        error: &MedvaultError,
        timestamp: DateTime<Utc>,
        request_id: Option<Ulid>,
    ) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            timestamp,
            request_id,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        self.code.status_code()
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServiceError {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn it_maps_every_error_to_its_status() {
        let cases = [
            (MedvaultError::Unauthenticated("x".into()), 401),
            (MedvaultError::Forbidden("x".into()), 403),
            (MedvaultError::NotFound("x".into()), 404),
            (MedvaultError::Conflict("x".into()), 409),
            (MedvaultError::Validation("x".into()), 400),
            (MedvaultError::Internal("x".into()), 500),
        ];

        for (error, status) in cases {
            assert_eq!(error.code().status_code(), status);
        }
    }

    #[test]
    fn it_maps_store_errors_into_the_taxonomy() {
        let unique = StoreError::UniqueViolation {
            collection: "users",
            key: "email:a@b.c".into(),
        };
        let missing = StoreError::Missing {
            collection: "grants",
            id: "g".into(),
        };
        let backend = StoreError::Backend("disk on fire".into());

        assert_eq!(MedvaultError::from(unique).code(), ErrorCode::Conflict);
        assert_eq!(MedvaultError::from(missing).code(), ErrorCode::NotFound);
        assert_eq!(MedvaultError::from(backend).code(), ErrorCode::InternalError);
    }

    #[test]
    fn it_serializes_codes_in_screaming_snake_case() -> anyhow::Result<()> {
        let error = ServiceError::from_error(
            &MedvaultError::Validation("email is required".into()),
            DateTime::UNIX_EPOCH,
            None,
        );
        let json = serde_json::to_value(&error)?;

        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(error.status_code(), 400);
        assert!(json.get("request_id").is_none());
        Ok(())
    }
}
