//! Credential provider registry entry.
//!
//! Providers form a closed set; the manager inspects the variant once when a
//! provider is registered and afterwards only calls [`CredentialProvider::authenticate`].
use crate::auth::claims::{AuthenticatedIdentity, ProviderKind};
use crate::auth::directory::DirectoryProvider;
use crate::auth::local::LocalProvider;
use crate::auth::oidc::OidcProvider;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("provider does not accept passwords")]
    Unsupported,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

pub enum CredentialProvider {
    Local(LocalProvider),
    Directory(DirectoryProvider),
    Federated(OidcProvider),
}

impl CredentialProvider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Local(_) => ProviderKind::Local,
            Self::Directory(_) => ProviderKind::Ldap,
            Self::Federated(_) => ProviderKind::Oidc,
        }
    }

    /// True for providers that authenticate through a browser redirect
    /// instead of a username and password.
    pub fn supports_redirect_flow(&self) -> bool {
        matches!(self, Self::Federated(_))
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedIdentity, ProviderError> {
        match self {
            Self::Local(provider) => provider.authenticate(username, password).await,
            Self::Directory(provider) => provider.authenticate(username, password).await,
            Self::Federated(_) => Err(ProviderError::Unsupported),
        }
    }
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CredentialProvider").field(&self.kind()).finish()
    }
}
