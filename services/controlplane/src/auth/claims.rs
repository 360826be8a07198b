//! Normalized identity carried inside session tokens.
//!
//! Every credential provider produces the same [`Claims`] shape so handlers and
//! the policy engine never need to know which backend authenticated a caller.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sessionplane_authz::user_principal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Ldap,
    Oidc,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ldap => "ldap",
            Self::Oidc => "oidc",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity produced by a provider, before a session token is issued.
///
/// `subject` is the backend's own identifier (a username, or the `sub` of an
/// upstream ID token). It is qualified with the provider when claims are
/// built.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedIdentity {
    pub subject: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub provider: ProviderKind,
    pub extra: Map<String, Value>,
}

impl AuthenticatedIdentity {
    pub fn new(provider: ProviderKind, subject: &str, username: &str) -> Self {
        Self {
            subject: subject.to_string(),
            username: username.to_string(),
            email: None,
            roles: Vec::new(),
            provider,
            extra: Map::new(),
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email.filter(|value| !value.is_empty());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for role in roles {
            let role = role.into();
            if !role.is_empty() && !self.roles.contains(&role) {
                self.roles.push(role);
            }
        }
        self
    }
}

/// Session token payload.
///
/// `sub` is the policy principal, `user:<provider>:<subject>`. `username`
/// keeps the name the caller logged in with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub provider: ProviderKind,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn from_identity(identity: AuthenticatedIdentity, issuer: &str, iat: i64, exp: i64) -> Self {
        Self {
            sub: user_principal(identity.provider.as_str(), &identity.subject),
            username: identity.username,
            email: identity.email,
            roles: identity.roles,
            provider: identity.provider,
            iat,
            exp,
            iss: issuer.to_string(),
            extra: identity.extra,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|candidate| candidate == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_are_deduplicated_and_empty_dropped() {
        let identity = AuthenticatedIdentity::new(ProviderKind::Ldap, "bob", "bob")
            .with_roles(["role:viewer", "", "role:viewer", "role:editor"]);
        assert_eq!(identity.roles, vec!["role:viewer", "role:editor"]);
    }

    #[test]
    fn extras_flatten_into_the_payload() {
        let mut identity = AuthenticatedIdentity::new(ProviderKind::Oidc, "abc", "alice")
            .with_email(Some("alice@example.org".to_string()));
        identity
            .extra
            .insert("idp_issuer".to_string(), json!("https://idp.example"));
        let claims = Claims::from_identity(identity, "sessionplane", 10, 20);
        let value = serde_json::to_value(&claims).expect("serialize");
        assert_eq!(value["provider"], "oidc");
        assert_eq!(value["idp_issuer"], "https://idp.example");
        assert_eq!(value["email"], "alice@example.org");

        let back: Claims = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, claims);
    }

    #[test]
    fn subject_is_qualified_by_provider() {
        let ldap = Claims::from_identity(
            AuthenticatedIdentity::new(ProviderKind::Ldap, "alice", "alice"),
            "sessionplane",
            0,
            1,
        );
        let oidc = Claims::from_identity(
            AuthenticatedIdentity::new(ProviderKind::Oidc, "alice", "alice"),
            "sessionplane",
            0,
            1,
        );
        assert_eq!(ldap.sub, "user:ldap:alice");
        assert_eq!(oidc.sub, "user:oidc:alice");
        assert_eq!(ldap.username, oidc.username);
    }
}
