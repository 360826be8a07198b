//! Provider-agnostic authentication façade.
//!
//! # Purpose
//! Hold the registered credential providers, run password and federated
//! logins against them, and turn the resulting identity into a session token.
//!
//! # Key invariants
//! - Password providers are tried in registration order; the first success
//!   wins. Every failure collapses into [`AuthError::InvalidCredentials`] and
//!   the specific cause is only logged.
//! - At most one federated provider is registered.
//! - A backend identity whose subject looks like a role name is refused, so
//!   no account can pose as a role in the policy.
//! - Federated callbacks fail closed on any missing or mismatched value.
use crate::auth::claims::{AuthenticatedIdentity, Claims, ProviderKind};
use crate::auth::flow::{FlowCodec, FlowError};
use crate::auth::local::LocalProvider;
use crate::auth::oidc::{OidcError, OidcProvider};
use crate::auth::provider::{CredentialProvider, ProviderError};
use crate::auth::session_token::{IssuedToken, SessionTokens, TokenError};
use serde::Serialize;
use sessionplane_authz::{WILDCARD, is_role_name};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session invalid or expired")]
    InvalidSession(#[source] TokenError),
    #[error("federated login is not configured")]
    FederatedNotConfigured,
    #[error("federated login failed: {0}")]
    Flow(#[from] FlowError),
    #[error("federated login failed: {0}")]
    Oidc(#[from] OidcError),
    #[error("provider registration rejected: {0}")]
    Registration(String),
    #[error("token signing failed: {0}")]
    Token(#[source] TokenError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub redirect_flow: bool,
}

/// Start of a federated login: where to send the browser and the flow cookie
/// value to set alongside.
#[derive(Debug, Clone)]
pub struct FederatedStart {
    pub authorization_url: String,
    pub flow_cookie: String,
}

#[derive(Debug, Clone)]
pub struct FederatedCompletion {
    pub session: IssuedToken,
    pub redirect_to: Option<String>,
}

pub struct AuthManager {
    password_providers: Vec<CredentialProvider>,
    federated: Option<CredentialProvider>,
    tokens: SessionTokens,
    flows: FlowCodec,
}

impl AuthManager {
    pub fn new(tokens: SessionTokens, flows: FlowCodec) -> Self {
        Self {
            password_providers: Vec::new(),
            federated: None,
            tokens,
            flows,
        }
    }

    pub fn register(&mut self, provider: CredentialProvider) -> Result<(), AuthError> {
        if provider.supports_redirect_flow() {
            if self.federated.is_some() {
                return Err(AuthError::Registration(
                    "only one federated provider may be registered".to_string(),
                ));
            }
            tracing::info!(provider = %provider.kind(), "federated provider registered");
            self.federated = Some(provider);
            return Ok(());
        }
        if self
            .password_providers
            .iter()
            .any(|existing| existing.kind() == provider.kind())
        {
            return Err(AuthError::Registration(format!(
                "{} provider registered twice",
                provider.kind()
            )));
        }
        tracing::info!(provider = %provider.kind(), "password provider registered");
        self.password_providers.push(provider);
        Ok(())
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.password_providers
            .iter()
            .chain(self.federated.iter())
            .map(|provider| ProviderInfo {
                kind: provider.kind(),
                redirect_flow: provider.supports_redirect_flow(),
            })
            .collect()
    }

    pub fn local_provider(&self) -> Option<&LocalProvider> {
        self.password_providers.iter().find_map(|provider| match provider {
            CredentialProvider::Local(local) => Some(local),
            _ => None,
        })
    }

    fn oidc(&self) -> Option<&OidcProvider> {
        match &self.federated {
            Some(CredentialProvider::Federated(oidc)) => Some(oidc),
            _ => None,
        }
    }

    pub fn session_ttl(&self) -> std::time::Duration {
        self.tokens.ttl()
    }

    pub async fn login_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<IssuedToken, AuthError> {
        for provider in &self.password_providers {
            let kind = provider.kind();
            match provider.authenticate(username, password).await {
                Ok(identity) if !admissible(&identity) => {
                    record_attempt(kind, "rejected");
                    tracing::warn!(provider = %kind, subject = %identity.subject, "refusing identity with a reserved subject");
                }
                Ok(identity) => {
                    record_attempt(kind, "success");
                    tracing::info!(provider = %kind, subject = %identity.subject, "login succeeded");
                    return self.tokens.issue(identity).map_err(AuthError::Token);
                }
                Err(ProviderError::InvalidCredentials) => {
                    record_attempt(kind, "rejected");
                    tracing::debug!(provider = %kind, "credentials rejected");
                }
                Err(err) => {
                    record_attempt(kind, "error");
                    tracing::warn!(provider = %kind, error = %err, "credential provider failed");
                }
            }
        }
        Err(AuthError::InvalidCredentials)
    }

    pub async fn begin_federated(
        &self,
        redirect_to: Option<String>,
    ) -> Result<FederatedStart, AuthError> {
        let oidc = self.oidc().ok_or(AuthError::FederatedNotConfigured)?;
        let state = self.flows.begin(oidc.pkce_enabled(), redirect_to);
        let challenge = state.pkce_challenge();
        let authorization_url = oidc
            .authorization_url(&state.csrf, &state.nonce, challenge.as_deref())
            .await?;
        Ok(FederatedStart {
            authorization_url,
            flow_cookie: self.flows.encode(&state)?,
        })
    }

    /// Finish a federated login from the callback parameters and the flow
    /// cookie set by [`AuthManager::begin_federated`].
    pub async fn complete_federated(
        &self,
        flow_cookie: Option<&str>,
        state: Option<&str>,
        code: Option<&str>,
        provider_error: Option<&str>,
    ) -> Result<FederatedCompletion, AuthError> {
        let result = self
            .complete_federated_inner(flow_cookie, state, code, provider_error)
            .await;
        match &result {
            Ok(_) => record_attempt(ProviderKind::Oidc, "success"),
            Err(err) => {
                record_attempt(ProviderKind::Oidc, "rejected");
                tracing::warn!(error = %err, "federated login rejected");
            }
        }
        result
    }

    async fn complete_federated_inner(
        &self,
        flow_cookie: Option<&str>,
        state: Option<&str>,
        code: Option<&str>,
        provider_error: Option<&str>,
    ) -> Result<FederatedCompletion, AuthError> {
        let oidc = self.oidc().ok_or(AuthError::FederatedNotConfigured)?;
        let flow = self
            .flows
            .decode(flow_cookie.ok_or(FlowError::Missing)?)?;
        flow.verify_state(state.unwrap_or_default())?;
        if let Some(error) = provider_error {
            return Err(FlowError::ProviderDenied(error.to_string()).into());
        }
        let code = code.filter(|code| !code.is_empty()).ok_or(FlowError::MissingCode)?;

        let id_token = oidc
            .exchange_code(code, flow.pkce_verifier.as_deref())
            .await?;
        let identity = oidc.validate_id_token(&id_token, &flow.nonce).await?;
        if !admissible(&identity) {
            tracing::warn!(subject = %identity.subject, "refusing identity with a reserved subject");
            return Err(AuthError::InvalidCredentials);
        }
        tracing::info!(subject = %identity.subject, "federated login succeeded");
        Ok(FederatedCompletion {
            session: self.tokens.issue(identity).map_err(AuthError::Token)?,
            redirect_to: flow.redirect_to,
        })
    }

    pub fn validate_session(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens.validate(token).map_err(AuthError::InvalidSession)
    }

    pub fn refresh(&self, token: &str) -> Result<IssuedToken, AuthError> {
        self.tokens.refresh(token).map_err(AuthError::InvalidSession)
    }

    /// Upstream end-session URL, when a federated provider is active and
    /// advertises one.
    pub async fn logout_redirect(&self) -> Option<String> {
        let oidc = self.oidc()?;
        match oidc.end_session_url().await {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, "end-session endpoint unavailable");
                None
            }
        }
    }
}

// Subjects that would collide with policy names.
fn admissible(identity: &AuthenticatedIdentity) -> bool {
    let subject = identity.subject.as_str();
    !subject.is_empty() && subject != WILDCARD && !is_role_name(subject)
}

fn record_attempt(provider: ProviderKind, outcome: &'static str) {
    metrics::counter!(
        "sessionplane_auth_attempts_total",
        "provider" => provider.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}
