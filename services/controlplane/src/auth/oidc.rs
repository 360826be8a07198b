//! Federated login against an upstream OpenID Connect provider.
//!
//! # Purpose
//! Drive the authorization-code flow: build the authorization redirect,
//! exchange the returned code, and validate the ID token before its claims
//! are normalized into an [`AuthenticatedIdentity`].
//!
//! # Key invariants
//! - Only ES256 is accepted by default; RS256 is allowed only when the
//!   `oidc-rsa` feature is enabled.
//! - `iss` must equal the configured issuer and `aud` must contain the client
//!   id. The `nonce` claim must match the value stored in the flow cookie.
//! - Discovery documents and JWKS are cached with a TTL; an unknown `kid`
//!   forces one JWKS refresh to pick up rotated keys.
//!
//! # Concurrency model
//! Caches live in `DashMap`s shared by every request task.
//!
//! # Security model and threat assumptions
//! - The callback query string is attacker controlled. Nothing from it is
//!   trusted until the ID token signature and claims have been verified.
//! - Claims are decoded without verification only to reject disallowed
//!   algorithms early; identity is read from the verified payload.
use crate::auth::claims::{AuthenticatedIdentity, ProviderKind};
use crate::config::OidcConfig;
use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 60;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("missing key id")]
    MissingKeyId,
    #[error("jwks key not found")]
    JwksKeyNotFound,
    #[error("invalid jwk: {0}")]
    InvalidJwk(String),
    #[error("invalid provider metadata: {0}")]
    InvalidMetadata(String),
    #[error("token endpoint returned status {0}")]
    TokenEndpoint(u16),
    #[error("token response carried no id_token")]
    MissingIdToken,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("invalid claim: {0}")]
    InvalidClaim(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Subset of the discovery document this service uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedMetadata {
    metadata: Arc<ProviderMetadata>,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

pub struct OidcProvider {
    config: OidcConfig,
    client: reqwest::Client,
    metadata_cache: Arc<DashMap<String, CachedMetadata>>,
    jwks_cache: Arc<DashMap<String, CachedJwks>>,
    cache_ttl: Duration,
    clock_skew_seconds: u64,
}

impl OidcProvider {
    pub fn new(config: OidcConfig) -> Result<Self, OidcError> {
        Self::with_cache_ttl(config, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(config: OidcConfig, cache_ttl: Duration) -> Result<Self, OidcError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            client,
            metadata_cache: Arc::new(DashMap::new()),
            jwks_cache: Arc::new(DashMap::new()),
            cache_ttl,
            clock_skew_seconds: DEFAULT_CLOCK_SKEW_SECONDS,
        })
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    pub fn pkce_enabled(&self) -> bool {
        self.config.pkce
    }

    fn discovery_url(&self) -> String {
        self.config.discovery_url.clone().unwrap_or_else(|| {
            format!(
                "{}/.well-known/openid-configuration",
                self.config.issuer.trim_end_matches('/')
            )
        })
    }

    pub async fn metadata(&self) -> Result<Arc<ProviderMetadata>, OidcError> {
        let url = self.discovery_url();
        if let Some(entry) = self.metadata_cache.get(&url)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.metadata.clone());
        }

        let metadata: ProviderMetadata = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if metadata.issuer.trim_end_matches('/') != self.config.issuer.trim_end_matches('/') {
            return Err(OidcError::InvalidMetadata("issuer mismatch".to_string()));
        }
        let metadata = Arc::new(metadata);
        self.metadata_cache.insert(
            url,
            CachedMetadata {
                metadata: metadata.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        Ok(metadata)
    }

    /// Build the authorization endpoint redirect for a new login attempt.
    pub async fn authorization_url(
        &self,
        state: &str,
        nonce: &str,
        code_challenge: Option<&str>,
    ) -> Result<String, OidcError> {
        let metadata = self.metadata().await?;
        let scope = self.config.scopes.join(" ");
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_url.as_str()),
            ("scope", scope.as_str()),
            ("state", state),
            ("nonce", nonce),
        ];
        if let Some(challenge) = code_challenge {
            params.push(("code_challenge", challenge));
            params.push(("code_challenge_method", "S256"));
        }
        let url = reqwest::Url::parse_with_params(&metadata.authorization_endpoint, &params)
            .map_err(|err| OidcError::InvalidMetadata(format!("authorization_endpoint: {err}")))?;
        Ok(url.into())
    }

    /// Redeem an authorization code for the raw ID token.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<String, OidcError> {
        let metadata = self.metadata().await?;
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_url.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }
        let response = self
            .client
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OidcError::TokenEndpoint(status.as_u16()));
        }
        let body: TokenResponse = response.json().await?;
        body.id_token.ok_or(OidcError::MissingIdToken)
    }

    /// Verify an ID token and map its claims to an identity.
    pub async fn validate_id_token(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<AuthenticatedIdentity, OidcError> {
        // Step 1: Check header algorithm before any network work.
        let header = decode_header(id_token)?;
        if !is_algorithm_allowed(header.alg) {
            return Err(OidcError::UnsupportedAlgorithm);
        }
        let kid = header.kid.as_deref().ok_or(OidcError::MissingKeyId)?;

        // Step 2: Resolve the signing key, refreshing JWKS once on a miss.
        let metadata = self.metadata().await?;
        let jwks = self.get_jwks(&metadata.jwks_uri).await?;
        let decoding_key = match find_jwk(&jwks, kid) {
            Some(key) => {
                ensure_jwk_matches_algorithm(key, header.alg)?;
                DecodingKey::from_jwk(key)?
            }
            None => {
                let refreshed = self.refresh_jwks(&metadata.jwks_uri).await?;
                let key = find_jwk(&refreshed, kid).ok_or(OidcError::JwksKeyNotFound)?;
                ensure_jwk_matches_algorithm(key, header.alg)?;
                DecodingKey::from_jwk(key)?
            }
        };

        // Step 3: Enforce issuer and audience.
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.clock_skew_seconds;

        // Step 4: Verify signature and registered claims.
        let token = decode::<Value>(id_token, &decoding_key, &validation)?;
        validate_iat(&token.claims, self.clock_skew_seconds)?;

        // Step 5: Bind the token to this login attempt.
        let nonce = extract_string_claim(&token.claims, "nonce").ok_or(OidcError::NonceMismatch)?;
        if !bool::from(nonce.as_bytes().ct_eq(expected_nonce.as_bytes())) {
            return Err(OidcError::NonceMismatch);
        }

        self.map_identity(&token.claims)
    }

    fn map_identity(&self, claims: &Value) -> Result<AuthenticatedIdentity, OidcError> {
        let subject = extract_string_claim(claims, "sub")
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| OidcError::InvalidClaim("sub".to_string()))?;
        let username =
            extract_string_claim(claims, &self.config.username_claim).unwrap_or_else(|| subject.clone());
        let roles = extract_list_claim(claims, self.config.roles_claim.as_deref());
        let mut identity = AuthenticatedIdentity::new(ProviderKind::Oidc, &subject, &username)
            .with_email(extract_string_claim(claims, "email"))
            .with_roles(roles);
        identity.extra.insert(
            "idp_issuer".to_string(),
            Value::String(self.config.issuer.clone()),
        );
        Ok(identity)
    }

    /// Where to send the browser after a local logout, when the provider
    /// advertises an end-session endpoint.
    pub async fn end_session_url(&self) -> Result<Option<String>, OidcError> {
        let metadata = self.metadata().await?;
        let Some(endpoint) = metadata.end_session_endpoint.as_deref() else {
            return Ok(None);
        };
        let mut params = vec![("client_id", self.config.client_id.as_str())];
        if let Some(target) = &self.config.post_logout_redirect_url {
            params.push(("post_logout_redirect_uri", target.as_str()));
        }
        let url = reqwest::Url::parse_with_params(endpoint, &params)
            .map_err(|err| OidcError::InvalidMetadata(format!("end_session_endpoint: {err}")))?;
        Ok(Some(url.into()))
    }

    async fn get_jwks(&self, jwks_url: &str) -> Result<JwkSet, OidcError> {
        if let Some(entry) = self.jwks_cache.get(jwks_url)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.jwks.clone());
        }
        self.refresh_jwks(jwks_url).await
    }

    async fn refresh_jwks(&self, jwks_url: &str) -> Result<JwkSet, OidcError> {
        let jwks: JwkSet = self
            .client
            .get(jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.jwks_cache.insert(
            jwks_url.to_string(),
            CachedJwks {
                jwks: jwks.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        Ok(jwks)
    }
}

fn is_algorithm_allowed(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::ES256)
        || (cfg!(feature = "oidc-rsa") && matches!(alg, Algorithm::RS256))
}

fn ensure_jwk_matches_algorithm(jwk: &Jwk, alg: Algorithm) -> Result<(), OidcError> {
    let key_alg = jwk
        .common
        .key_algorithm
        .ok_or_else(|| OidcError::InvalidJwk("missing alg".to_string()))?;
    match (key_alg, alg) {
        (KeyAlgorithm::RS256, Algorithm::RS256) => {}
        (KeyAlgorithm::ES256, Algorithm::ES256) => {}
        _ => return Err(OidcError::InvalidJwk("alg mismatch".to_string())),
    }
    match (&jwk.algorithm, alg) {
        (AlgorithmParameters::RSA(_), Algorithm::RS256) => Ok(()),
        (AlgorithmParameters::EllipticCurve(params), Algorithm::ES256) => {
            if params.curve != EllipticCurve::P256 {
                return Err(OidcError::InvalidJwk("unexpected EC curve".to_string()));
            }
            Ok(())
        }
        _ => Err(OidcError::InvalidJwk("kty mismatch".to_string())),
    }
}

fn find_jwk<'a>(jwks: &'a JwkSet, kid: &str) -> Option<&'a Jwk> {
    jwks.keys
        .iter()
        .find(|key| key.common.key_id.as_deref() == Some(kid))
}

fn extract_string_claim(claims: &Value, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

fn validate_iat(claims: &Value, leeway_seconds: u64) -> Result<(), OidcError> {
    let iat = claims
        .get("iat")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| OidcError::InvalidClaim("iat".to_string()))?;
    if iat > Utc::now().timestamp() + leeway_seconds as i64 {
        return Err(OidcError::InvalidClaim("iat in future".to_string()));
    }
    Ok(())
}

// Role claims may be a string or an array of strings.
fn extract_list_claim(claims: &Value, name: Option<&str>) -> Vec<String> {
    let Some(value) = name.and_then(|name| claims.get(name)) else {
        return Vec::new();
    };
    if let Some(values) = value.as_array() {
        return values
            .iter()
            .filter_map(|item| item.as_str().map(|val| val.to_string()))
            .collect();
    }
    value
        .as_str()
        .map(|value| vec![value.to_string()])
        .unwrap_or_default()
}
