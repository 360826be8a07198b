//! Control-plane HTTP API module.
//!
//! # Purpose
//! Route handlers outside the `/auth` surface, plus the shared error and
//! payload types.
pub mod admin;
pub mod error;
pub mod introspect;
pub mod sessions;
pub mod system;
pub mod types;

use sessionplane_authz::WILDCARD_DOMAIN;

/// Split a comma-separated query value, dropping blanks. Falls back to
/// `default` when nothing is left.
pub(crate) fn split_list(raw: Option<&str>, default: &[&str]) -> Vec<String> {
    let values: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        default.iter().map(|value| value.to_string()).collect()
    } else {
        values
    }
}

/// Domain used for cluster-scoped administrative permissions.
pub(crate) const ADMIN_DOMAIN: &str = WILDCARD_DOMAIN;
