//! Control-plane authentication.
//!
//! # Purpose
//! Credential providers (local users, directory bind, OIDC), the session
//! token codec, the federated login flow and the HTTP handlers that tie them
//! together.
pub mod claims;
pub mod cookies;
pub mod directory;
pub mod flow;
pub mod handlers;
pub mod local;
pub mod manager;
pub mod oidc;
pub mod provider;
pub mod session_token;
