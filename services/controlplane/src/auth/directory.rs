//! Directory (LDAP) bind authentication.
use crate::auth::claims::{AuthenticatedIdentity, ProviderKind};
use crate::auth::provider::ProviderError;
use crate::config::LdapConfig;
use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// LDAP result code for a failed simple bind.
const INVALID_CREDENTIALS_RC: u32 = 49;

/// What a successful bind yields about the account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub email: Option<String>,
    pub groups: Vec<String>,
}

#[async_trait]
pub trait DirectoryBinder: Send + Sync {
    /// Bind as `dn` and read the account's mail and group memberships.
    async fn bind(&self, dn: &str, password: &str) -> Result<DirectoryEntry, ProviderError>;
}

pub struct LdapBinder {
    url: String,
    group_base_dn: Option<String>,
    member_attribute: String,
    starttls: bool,
    timeout: Duration,
}

impl LdapBinder {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            url: config.url.clone(),
            group_base_dn: config.group_base_dn.clone(),
            member_attribute: config.group_member_attribute.clone(),
            starttls: config.starttls,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn bind_inner(&self, dn: &str, password: &str) -> Result<DirectoryEntry, ProviderError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(self.starttls);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(unavailable)?;
        ldap3::drive!(conn);

        let bind = ldap.simple_bind(dn, password).await.map_err(unavailable)?;
        if bind.rc == INVALID_CREDENTIALS_RC {
            let _ = ldap.unbind().await;
            return Err(ProviderError::InvalidCredentials);
        }
        bind.success().map_err(unavailable)?;

        let mut entry = DirectoryEntry::default();
        let (accounts, _) = ldap
            .search(dn, Scope::Base, "(objectClass=*)", vec!["mail"])
            .await
            .and_then(|result| result.success())
            .map_err(unavailable)?;
        if let Some(account) = accounts.into_iter().next() {
            let account = SearchEntry::construct(account);
            entry.email = account.attrs.get("mail").and_then(|values| values.first().cloned());
        }

        if let Some(base) = &self.group_base_dn {
            let filter = format!("({}={})", self.member_attribute, ldap3::ldap_escape(dn));
            let (groups, _) = ldap
                .search(base, Scope::Subtree, &filter, vec!["cn"])
                .await
                .and_then(|result| result.success())
                .map_err(unavailable)?;
            for group in groups {
                let group = SearchEntry::construct(group);
                if let Some(cn) = group.attrs.get("cn").and_then(|values| values.first()) {
                    entry.groups.push(cn.clone());
                }
            }
        }
        let _ = ldap.unbind().await;
        Ok(entry)
    }
}

fn unavailable(err: ldap3::LdapError) -> ProviderError {
    ProviderError::Unavailable(err.to_string())
}

#[async_trait]
impl DirectoryBinder for LdapBinder {
    async fn bind(&self, dn: &str, password: &str) -> Result<DirectoryEntry, ProviderError> {
        match tokio::time::timeout(self.timeout, self.bind_inner(dn, password)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Unavailable("ldap bind timed out".to_string())),
        }
    }
}

pub struct DirectoryProvider {
    binder: Arc<dyn DirectoryBinder>,
    bind_dn_template: String,
    group_roles: HashMap<String, Vec<String>>,
    default_roles: Vec<String>,
}

impl DirectoryProvider {
    pub fn new(config: &LdapConfig, binder: Arc<dyn DirectoryBinder>) -> Result<Self, ProviderError> {
        if !config.bind_dn_template.contains("{username}") {
            return Err(ProviderError::Misconfigured(
                "bind_dn_template must contain {username}".to_string(),
            ));
        }
        Ok(Self {
            binder,
            bind_dn_template: config.bind_dn_template.clone(),
            group_roles: config.group_roles.clone(),
            default_roles: config.default_roles.clone(),
        })
    }

    pub fn from_config(config: &LdapConfig) -> Result<Self, ProviderError> {
        Self::new(config, Arc::new(LdapBinder::new(config)))
    }

    fn bind_dn(&self, username: &str) -> String {
        self.bind_dn_template
            .replace("{username}", &ldap3::dn_escape(username))
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedIdentity, ProviderError> {
        // An empty password turns a simple bind into an unauthenticated bind,
        // which most servers accept.
        if username.trim().is_empty() || password.is_empty() {
            return Err(ProviderError::InvalidCredentials);
        }
        let entry = self.binder.bind(&self.bind_dn(username), password).await?;
        let mapped = entry
            .groups
            .iter()
            .filter_map(|group| self.group_roles.get(group))
            .flatten()
            .cloned();
        Ok(AuthenticatedIdentity::new(ProviderKind::Ldap, username, username)
            .with_email(entry.email)
            .with_roles(self.default_roles.iter().cloned().chain(mapped)))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::sync::Mutex;

    /// In-memory directory keyed by bind DN.
    #[derive(Default)]
    pub struct StaticDirectory {
        accounts: HashMap<String, (String, DirectoryEntry)>,
        pub binds: Mutex<Vec<String>>,
        offline: bool,
    }

    impl StaticDirectory {
        pub fn offline() -> Self {
            Self {
                offline: true,
                ..Self::default()
            }
        }

        pub fn with_account(mut self, dn: &str, password: &str, groups: &[&str]) -> Self {
            self.accounts.insert(
                dn.to_string(),
                (
                    password.to_string(),
                    DirectoryEntry {
                        email: Some("user@example.org".to_string()),
                        groups: groups.iter().map(|group| group.to_string()).collect(),
                    },
                ),
            );
            self
        }
    }

    #[async_trait]
    impl DirectoryBinder for StaticDirectory {
        async fn bind(&self, dn: &str, password: &str) -> Result<DirectoryEntry, ProviderError> {
            self.binds.lock().expect("binds").push(dn.to_string());
            if self.offline {
                return Err(ProviderError::Unavailable("connection refused".to_string()));
            }
            match self.accounts.get(dn) {
                Some((expected, entry)) if expected == password => Ok(entry.clone()),
                _ => Err(ProviderError::InvalidCredentials),
            }
        }
    }

    pub fn ldap_config() -> LdapConfig {
        LdapConfig {
            url: "ldap://127.0.0.1:389".to_string(),
            bind_dn_template: "uid={username},ou=people,dc=example,dc=org".to_string(),
            group_base_dn: Some("ou=groups,dc=example,dc=org".to_string()),
            group_member_attribute: "member".to_string(),
            group_roles: HashMap::from([
                ("admins".to_string(), vec!["role:admin".to_string()]),
                ("editors".to_string(), vec!["role:editor".to_string()]),
            ]),
            default_roles: vec!["role:viewer".to_string()],
            starttls: false,
            timeout_secs: 1,
        }
    }
}
