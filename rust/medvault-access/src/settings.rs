use serde::{Deserialize, Deserializer, Serialize};

use crate::{MasterKey, MedvaultError};

/// Seven years.
pub const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 2555;

/// A century. Longer retention would push `retain_until` toward the end of
/// representable time.
pub const MAX_AUDIT_RETENTION_DAYS: u32 = 36_500;

/// 16 MiB.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

/// Attempts beyond the first when a grant write loses a race.
pub const DEFAULT_GRANT_WRITE_RETRIES: usize = 3;

/// Runtime configuration of a [crate::MedicalRecords] service.
///
/// Every field has a default; [Settings::from_env] overrides them from
/// `MEDVAULT_*` environment variables.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum days an audit entry is retained, at most
    /// [MAX_AUDIT_RETENTION_DAYS]
    #[serde(deserialize_with = "retention_days")]
    pub audit_retention_days: u32,
    /// Largest document content accepted, in bytes
    pub max_content_length: usize,
    /// Base64 encoded 32 byte key that data keys are wrapped under
    pub master_key: Option<String>,
    /// Retries after a lost compare-and-swap on a grant
    pub grant_write_retries: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            master_key: None,
            grant_write_retries: DEFAULT_GRANT_WRITE_RETRIES,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("audit_retention_days", &self.audit_retention_days)
            .field("max_content_length", &self.max_content_length)
            .field("master_key", &self.master_key.as_ref().map(|_| ".."))
            .field("grant_write_retries", &self.grant_write_retries)
            .finish()
    }
}

impl Settings {
    /// Defaults, overridden by `MEDVAULT_AUDIT_RETENTION_DAYS`,
    /// `MEDVAULT_MAX_CONTENT_LENGTH`, `MEDVAULT_MASTER_KEY` and
    /// `MEDVAULT_GRANT_WRITE_RETRIES` where set.
    pub fn from_env() -> Result<Self, MedvaultError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [Settings::from_env], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MedvaultError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(value) = lookup("MEDVAULT_AUDIT_RETENTION_DAYS") {
            settings.audit_retention_days =
                check_retention(parse("MEDVAULT_AUDIT_RETENTION_DAYS", &value)?)?;
        }
        if let Some(value) = lookup("MEDVAULT_MAX_CONTENT_LENGTH") {
            settings.max_content_length = parse("MEDVAULT_MAX_CONTENT_LENGTH", &value)?;
        }
        if let Some(value) = lookup("MEDVAULT_MASTER_KEY") {
            settings.master_key = Some(value);
        }
        if let Some(value) = lookup("MEDVAULT_GRANT_WRITE_RETRIES") {
            settings.grant_write_retries = parse("MEDVAULT_GRANT_WRITE_RETRIES", &value)?;
        }

        Ok(settings)
    }

    /// Decode the configured master key.
    pub fn master_key(&self) -> Result<MasterKey, MedvaultError> {
        let encoded = self
            .master_key
            .as_deref()
            .ok_or_else(|| MedvaultError::Validation("No master key configured".into()))?;
        MasterKey::from_base64(encoded)
    }
}

fn check_retention(days: u32) -> Result<u32, MedvaultError> {
    if days > MAX_AUDIT_RETENTION_DAYS {
        return Err(MedvaultError::Validation(format!(
            "Audit retention of {days} days exceeds the maximum of {MAX_AUDIT_RETENTION_DAYS}"
        )));
    }
    Ok(days)
}

fn retention_days<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    check_retention(u32::deserialize(deserializer)?).map_err(serde::de::Error::custom)
}

fn parse<T>(name: &str, value: &str) -> Result<T, MedvaultError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|error| MedvaultError::Validation(format!("Invalid {name} '{value}': {error}")))
}
