//! Short-lived state for an in-flight federated login.
//!
//! The state travels in a cookie as `base64url(json).base64url(hmac)`. It is
//! never stored server side, so any replica can finish a login another replica
//! started.
use crate::auth::session_token::now_epoch_seconds;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("login flow cookie missing")]
    Missing,
    #[error("login flow cookie malformed")]
    Malformed,
    #[error("login flow cookie signature invalid")]
    BadSignature,
    #[error("login flow expired")]
    Expired,
    #[error("state parameter mismatch")]
    StateMismatch,
    #[error("authorization code missing")]
    MissingCode,
    #[error("identity provider returned an error: {0}")]
    ProviderDenied(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// Anti-forgery value echoed back as the OAuth `state` parameter.
    pub csrf: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce_verifier: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl FlowState {
    pub fn pkce_challenge(&self) -> Option<String> {
        self.pkce_verifier.as_deref().map(pkce_challenge)
    }

    /// Compare the returned `state` parameter in constant time.
    pub fn verify_state(&self, returned: &str) -> Result<(), FlowError> {
        if returned.is_empty() || !bool::from(self.csrf.as_bytes().ct_eq(returned.as_bytes())) {
            return Err(FlowError::StateMismatch);
        }
        Ok(())
    }
}

/// S256 code challenge for a PKCE verifier.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct FlowCodec {
    key: Vec<u8>,
    ttl: Duration,
}

impl FlowCodec {
    /// Derive the cookie signing key from the session secret so the two
    /// never share a MAC key.
    pub fn new(session_secret: &[u8], ttl: Duration) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"sessionplane-login-flow|");
        hasher.update(session_secret);
        Self {
            key: hasher.finalize().to_vec(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn begin(&self, pkce: bool, redirect_to: Option<String>) -> FlowState {
        FlowState {
            csrf: random_token(),
            nonce: random_token(),
            pkce_verifier: pkce.then(random_token),
            exp: now_epoch_seconds() + self.ttl.as_secs() as i64,
            redirect_to,
        }
    }

    fn mac(&self) -> Result<HmacSha256, FlowError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| FlowError::BadSignature)
    }

    pub fn encode(&self, state: &FlowState) -> Result<String, FlowError> {
        let json = serde_json::to_vec(state).map_err(|_| FlowError::Malformed)?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn decode(&self, value: &str) -> Result<FlowState, FlowError> {
        self.decode_at(value, now_epoch_seconds())
    }

    fn decode_at(&self, value: &str, now: i64) -> Result<FlowState, FlowError> {
        let (payload, signature) = value.split_once('.').ok_or(FlowError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| FlowError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| FlowError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| FlowError::Malformed)?;
        let state: FlowState = serde_json::from_slice(&json).map_err(|_| FlowError::Malformed)?;
        if state.exp <= now {
            return Err(FlowError::Expired);
        }
        Ok(state)
    }
}
