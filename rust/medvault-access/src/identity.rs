//! Principals and the identifiers every entity is keyed by.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use medvault_storage::Record;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::MedvaultError;

macro_rules! ulid_identifier {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Mint a fresh, time-ordered identifier.
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// The underlying ULID.
            pub fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl From<Ulid> for $name {
            fn from(value: Ulid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = MedvaultError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self).map_err(|error| {
                    MedvaultError::Validation(format!("Invalid {} '{value}': {error}", $label))
                })
            }
        }
    };
}

ulid_identifier!(
    /// Identifies a [User]
    UserId,
    "user id"
);
ulid_identifier!(
    /// Identifies a [crate::MedicalDocument]
    DocumentId,
    "document id"
);
ulid_identifier!(
    /// Identifies an [crate::AccessGrant]
    GrantId,
    "grant id"
);
ulid_identifier!(
    /// Identifies an [crate::EncryptionKey]
    KeyId,
    "key id"
);
ulid_identifier!(
    /// Identifies an [crate::AuditEntry]
    AuditEntryId,
    "audit entry id"
);

/// The closed set of roles a [User] can hold.
///
/// The role is fixed at registration; nothing changes it afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns medical documents about themself
    Patient,
    /// Authors medical documents about patients
    Doctor,
    /// Operates the system
    Admin,
}

impl Role {
    /// The lowercase wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MedvaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "admin" => Ok(Role::Admin),
            other => Err(MedvaultError::Validation(format!(
                "Invalid role '{other}'. Must be one of: patient, doctor, admin"
            ))),
        }
    }
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable identifier
    pub id: UserId,
    /// Globally unique (case-insensitively) login email
    pub email: String,
    /// Opaque to this crate; produced and checked by the credential layer
    pub credential_hash: String,
    /// Immutable after registration
    pub role: Role,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Deactivated users can no longer authenticate
    pub is_active: bool,
    /// Set once the user enrolls a second factor
    pub mfa_secret: Option<String>,
    /// Role-specific profile fields
    #[serde(default)]
    pub details: ProfileDetails,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// The principal this user acts as once authenticated.
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.id,
            role: self.role,
        }
    }

    /// The form of the email that uniqueness is enforced on.
    pub fn normalized_email(email: &str) -> String {
        email.trim().to_lowercase()
    }

    /// Apply the parts of `update` this user's role may change, returning
    /// the names of the fields that were set.
    ///
    /// Names must stay non-empty. Fields belonging to another role are
    /// ignored; an update that sets nothing is rejected.
    pub fn apply_profile(
        &mut self,
        update: &ProfileUpdate,
    ) -> Result<Vec<&'static str>, MedvaultError> {
        let mut updated = Vec::new();

        for (field, value, target) in [
            ("first_name", &update.first_name, &mut self.first_name),
            ("last_name", &update.last_name, &mut self.last_name),
        ] {
            if let Some(value) = value {
                let value = value.trim();
                if value.is_empty() {
                    return Err(MedvaultError::Validation(format!("{field} cannot be empty")));
                }
                *target = value.to_string();
                updated.push(field);
            }
        }

        let details = &mut self.details;
        let role_fields = match self.role {
            Role::Doctor => vec![
                ("specialization", &update.specialization, &mut details.specialization),
                ("department", &update.department, &mut details.department),
            ],
            Role::Patient => vec![
                (
                    "emergency_contact",
                    &update.emergency_contact,
                    &mut details.emergency_contact,
                ),
                ("insurance_info", &update.insurance_info, &mut details.insurance_info),
            ],
            Role::Admin => Vec::new(),
        };
        for (field, value, target) in role_fields {
            if let Some(value) = value {
                *target = Some(value.trim().to_string()).filter(|value| !value.is_empty());
                updated.push(field);
            }
        }

        if updated.is_empty() {
            return Err(MedvaultError::Validation(
                "No valid fields provided for update".into(),
            ));
        }
        Ok(updated)
    }
}

impl Record for User {
    const COLLECTION: &'static str = "users";

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn unique_keys(&self) -> Vec<String> {
        vec![format!("email:{}", Self::normalized_email(&self.email))]
    }
}

/// Profile fields that only some roles carry. Empty for the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDetails {
    /// A doctor's specialty
    pub specialization: Option<String>,
    /// A doctor's department
    pub department: Option<String>,
    /// Whom to call about a patient
    pub emergency_contact: Option<String>,
    /// A patient's insurer and policy
    pub insurance_info: Option<String>,
}

/// A change to the caller's own profile.
///
/// Anything else in the payload, the role and email included, is not
/// representable here and so never applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    /// New given name
    pub first_name: Option<String>,
    /// New family name
    pub last_name: Option<String>,
    /// Doctors only
    pub specialization: Option<String>,
    /// Doctors only
    pub department: Option<String>,
    /// Patients only
    pub emergency_contact: Option<String>,
    /// Patients only
    pub insurance_info: Option<String>,
}

/// An authenticated user performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Principal {
    /// Who is acting
    pub id: UserId,
    /// In which role
    pub role: Role,
}

/// The parts of a [User] that may leave the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    /// Stable identifier
    pub id: UserId,
    /// Normalized login email
    pub email: String,
    /// The role fixed at registration
    pub role: Role,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Whether the account may authenticate
    pub is_active: bool,
    /// Whether a second factor is enrolled; the secret never leaves
    pub mfa_enabled: bool,
    /// Role-specific profile fields
    pub details: ProfileDetails,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            is_active: user.is_active,
            mfa_enabled: user.mfa_secret.is_some(),
            details: user.details.clone(),
            created_at: user.created_at,
        }
    }
}
