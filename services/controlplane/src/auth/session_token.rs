//! Session token minting and verification.
//!
//! # Purpose
//! Issue and validate the HS256 JWTs that carry [`Claims`] between requests.
//!
//! # Key invariants
//! - Only HS256 is accepted; the algorithm is pinned in the validation config.
//! - `iss`, `sub` and `exp` are mandatory and validated.
//! - Refresh only succeeds for a token that is currently valid.
//!
//! # Security model and threat assumptions
//! - Attackers may present arbitrary JWTs, including `alg: none` and tokens
//!   signed by other keys; both fail signature validation.
//! - The shared secret must be at least 32 bytes; shorter secrets are refused
//!   at construction.
use crate::auth::claims::{AuthenticatedIdentity, Claims};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("session secret must be at least 32 bytes")]
    WeakSecret,
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// A freshly signed token and the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl: Duration,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionTokens {
    pub fn new(secret: &[u8], issuer: &str, ttl: Duration) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret);
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, identity: AuthenticatedIdentity) -> Result<IssuedToken, TokenError> {
        let now = now_epoch_seconds();
        let claims = Claims::from_identity(identity, &self.issuer, now, now + self.ttl.as_secs() as i64);
        self.sign(claims)
    }

    fn sign(&self, claims: Claims) -> Result<IssuedToken, TokenError> {
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken { token, claims })
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }

    /// Re-sign the claims of a currently valid token with a new lifetime.
    pub fn refresh(&self, token: &str) -> Result<IssuedToken, TokenError> {
        let mut claims = self.validate(token)?;
        let now = now_epoch_seconds();
        claims.iat = now;
        claims.exp = now + self.ttl.as_secs() as i64;
        self.sign(claims)
    }
}

pub(crate) fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::ProviderKind;
    use jsonwebtoken::errors::ErrorKind;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn tokens() -> SessionTokens {
        SessionTokens::new(SECRET, "sessionplane", Duration::from_secs(600)).expect("tokens")
    }

    fn identity() -> AuthenticatedIdentity {
        AuthenticatedIdentity::new(ProviderKind::Local, "alice", "alice").with_roles(["role:admin"])
    }

    #[test]
    fn weak_secret_is_rejected() {
        let err = SessionTokens::new(b"short", "sessionplane", Duration::from_secs(60))
            .expect_err("weak");
        assert!(matches!(err, TokenError::WeakSecret));
    }

    #[test]
    fn issue_then_validate() {
        let tokens = tokens();
        let issued = tokens.issue(identity()).expect("issue");
        assert_eq!(issued.claims.exp - issued.claims.iat, 600);
        let claims = tokens.validate(&issued.token).expect("validate");
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.iss, "sessionplane");
        assert!(claims.has_role("role:admin"));
    }

    #[test]
    fn rejects_foreign_secret_and_issuer() {
        let issued = tokens().issue(identity()).expect("issue");
        let other = SessionTokens::new(
            b"ffffffffffffffffffffffffffffffff",
            "sessionplane",
            Duration::from_secs(600),
        )
        .expect("tokens");
        assert!(other.validate(&issued.token).is_err());

        let other_issuer =
            SessionTokens::new(SECRET, "someone-else", Duration::from_secs(600)).expect("tokens");
        let err = other_issuer.validate(&issued.token).expect_err("issuer");
        assert!(matches!(err, TokenError::Jwt(ref e) if matches!(e.kind(), ErrorKind::InvalidIssuer)));
    }

    #[test]
    fn expired_tokens_cannot_be_refreshed() {
        let tokens = tokens();
        let now = now_epoch_seconds();
        let stale = Claims::from_identity(identity(), "sessionplane", now - 120, now - 60);
        let issued = tokens.sign(stale).expect("sign");
        let err = tokens.refresh(&issued.token).expect_err("expired");
        assert!(matches!(err, TokenError::Jwt(ref e) if matches!(e.kind(), ErrorKind::ExpiredSignature)));
    }

    #[test]
    fn refresh_extends_a_valid_token() {
        let tokens = tokens();
        let now = now_epoch_seconds();
        let short = Claims::from_identity(identity(), "sessionplane", now - 10, now + 5);
        let issued = tokens.sign(short).expect("sign");
        let refreshed = tokens.refresh(&issued.token).expect("refresh");
        assert!(refreshed.claims.exp >= now + 600);
        assert_eq!(refreshed.claims.roles, vec!["role:admin"]);
    }

    #[test]
    fn unsigned_tokens_are_rejected() {
        // {"alg":"none","typ":"JWT"}
        let header = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0";
        let issued = tokens().issue(identity()).expect("issue");
        let payload = issued.token.split('.').nth(1).expect("payload");
        let forged = format!("{header}.{payload}.");
        assert!(tokens().validate(&forged).is_err());
    }
}
