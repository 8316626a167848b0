//! What the core learns about a caller from the layer in front of it.

use std::fmt;

use async_trait::async_trait;
use ulid::Ulid;

use crate::{MedvaultError, UserId};

/// An opaque credential presented by a caller (a bearer token, a session
/// cookie). Only a [CredentialVerifier] knows how to interpret it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials(String);

impl Credentials {
    /// Wrap a bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(..)")
    }
}

/// Resolves credentials to the user they were issued to.
///
/// Password hashing and token issuance live behind this trait; the core
/// only needs to know who is calling.
#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    /// The user `credentials` belong to, or [MedvaultError::Unauthenticated].
    async fn verify(&self, credentials: &Credentials) -> Result<UserId, MedvaultError>;
}

#[async_trait]
impl<T> CredentialVerifier for std::sync::Arc<T>
where
    T: CredentialVerifier + ?Sized,
{
    async fn verify(&self, credentials: &Credentials) -> Result<UserId, MedvaultError> {
        self.as_ref().verify(credentials).await
    }
}

/// Per-request facts supplied by the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Absent for anonymous calls such as registration
    pub credentials: Option<Credentials>,
    /// Origin address, when the transport knows it
    pub ip_address: Option<String>,
    /// Client identification, when sent
    pub user_agent: Option<String>,
    /// Correlates the audit entries of this request
    pub request_id: Ulid,
}

impl RequestContext {
    /// A request carrying no credentials.
    pub fn anonymous() -> Self {
        Self {
            credentials: None,
            ip_address: None,
            user_agent: None,
            request_id: Ulid::new(),
        }
    }

    /// A request authenticated by `credentials`.
    pub fn authenticated(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::anonymous()
        }
    }

    /// Attach the caller's network origin.
    pub fn from_origin(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }
}

#[cfg(any(test, feature = "helpers"))]
mod helpers {
    use std::{collections::HashMap, sync::Arc};

    use async_trait::async_trait;
    use parking_lot::RwLock;
    use ulid::Ulid;

    use super::{CredentialVerifier, Credentials};
    use crate::{MedvaultError, UserId};

    /// A [CredentialVerifier] that accepts tokens it handed out itself.
    #[derive(Debug, Clone, Default)]
    pub struct StaticCredentialVerifier {
        tokens: Arc<RwLock<HashMap<String, UserId>>>,
    }

    impl StaticCredentialVerifier {
        /// Mint a token for `user`.
        pub fn issue(&self, user: UserId) -> Credentials {
            let token = format!("token-{}", Ulid::new());
            self.tokens.write().insert(token.clone(), user);
            Credentials::bearer(token)
        }

        /// Forget a token.
        pub fn revoke(&self, credentials: &Credentials) {
            self.tokens.write().remove(credentials.token());
        }
    }

    #[async_trait]
    impl CredentialVerifier for StaticCredentialVerifier {
        async fn verify(&self, credentials: &Credentials) -> Result<UserId, MedvaultError> {
            self.tokens
                .read()
                .get(credentials.token())
                .copied()
                .ok_or_else(|| MedvaultError::Unauthenticated("Invalid or expired token".into()))
        }
    }
}

#[cfg(any(test, feature = "helpers"))]
pub use helpers::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_only_accepts_issued_tokens() -> anyhow::Result<()> {
        let verifier = StaticCredentialVerifier::default();
        let user = UserId::generate();
        let credentials = verifier.issue(user);

        assert_eq!(verifier.verify(&credentials).await?, user);

        verifier.revoke(&credentials);
        let result = verifier.verify(&credentials).await;

        assert!(matches!(result, Err(MedvaultError::Unauthenticated(_))));
        Ok(())
    }

    #[test]
    fn it_keeps_tokens_out_of_debug_output() {
        let context = RequestContext::authenticated(Credentials::bearer("secret-token"));

        assert!(!format!("{context:?}").contains("secret-token"));
    }
}
