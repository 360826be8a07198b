use anyhow::{Context, Result, bail};
use crate::auth::session_token::MIN_SECRET_LEN;
use kube::core::{GroupVersion, GroupVersionKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SESSION_TTL_SECS: u64 = 8 * 60 * 60;
pub const DEFAULT_KUBE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_COOKIE_NAME: &str = "sessionplane_session";
pub const DEFAULT_ISSUER: &str = "sessionplane";
/// `<group>/<version>/<Kind>` (or `<version>/<Kind>` for the core group) of
/// the resources that sessions run as.
pub const DEFAULT_SESSION_RESOURCE: &str = "apps/v1/Deployment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSiteMode {
    Strict,
    #[default]
    Lax,
    None,
}

impl std::str::FromStr for SameSiteMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lax" => Ok(Self::Lax),
            "none" => Ok(Self::None),
            other => bail!("unknown SameSite mode: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl: Duration,
    pub issuer: String,
    pub cookie_name: String,
    pub same_site: SameSiteMode,
    /// Always mark cookies `Secure`, regardless of forwarded headers.
    pub force_secure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LdapConfig {
    pub url: String,
    /// DN template; `{username}` is replaced with the DN-escaped login name.
    pub bind_dn_template: String,
    #[serde(default)]
    pub group_base_dn: Option<String>,
    #[serde(default = "default_member_attribute")]
    pub group_member_attribute: String,
    #[serde(default)]
    pub group_roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub default_roles: Vec<String>,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default = "default_ldap_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_member_attribute() -> String {
    "member".to_string()
}

fn default_ldap_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_url: String,
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub pkce: bool,
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    #[serde(default)]
    pub roles_claim: Option<String>,
    #[serde(default)]
    pub post_logout_redirect_url: Option<String>,
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "profile".to_string(),
        "email".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_username_claim() -> String {
    "preferred_username".to_string()
}

// Control plane configuration sourced from environment variables and an
// optional YAML file.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub pod_namespace: String,
    pub pod_name: Option<String>,
    pub cluster_wide: bool,
    pub kube_timeout: Duration,
    pub session: SessionConfig,
    pub policy_paths: Vec<PathBuf>,
    pub local_users_file: Option<PathBuf>,
    pub ldap: Option<LdapConfig>,
    pub oidc: Option<OidcConfig>,
    pub creator_key: Option<String>,
    pub session_resource: String,
}

#[derive(Debug, Default, Deserialize)]
struct ControlPlaneConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    pod_namespace: Option<String>,
    cluster_wide: Option<bool>,
    kube_timeout_ms: Option<u64>,
    session_secret: Option<String>,
    session_ttl_secs: Option<u64>,
    issuer: Option<String>,
    cookie_name: Option<String>,
    cookie_same_site: Option<SameSiteMode>,
    cookie_secure: Option<bool>,
    policy_paths: Option<Vec<PathBuf>>,
    local_users_file: Option<PathBuf>,
    ldap: Option<LdapConfig>,
    oidc: Option<OidcConfig>,
    creator_key: Option<String>,
    session_resource: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    env_opt(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("parse {key}: expected a boolean, got {other}"),
        })
        .transpose()
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    env_opt(key)
        .map(|value| value.parse().with_context(|| format!("parse {key}")))
        .transpose()
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_opt("SESSIONPLANE_BIND")
            .unwrap_or_else(|| "0.0.0.0:8443".to_string())
            .parse()
            .with_context(|| "parse SESSIONPLANE_BIND")?;
        let metrics_bind = env_opt("SESSIONPLANE_METRICS_BIND")
            .unwrap_or_else(|| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse SESSIONPLANE_METRICS_BIND")?;
        let same_site = env_opt("SESSIONPLANE_COOKIE_SAMESITE")
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or_default();
        let policy_paths = env_opt("SESSIONPLANE_POLICY_PATHS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            metrics_bind,
            pod_namespace: env_opt("POD_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            pod_name: env_opt("POD_NAME").or_else(|| env_opt("HOSTNAME")),
            cluster_wide: env_bool("SESSIONPLANE_CLUSTER_WIDE")?.unwrap_or(false),
            kube_timeout: Duration::from_millis(
                env_u64("SESSIONPLANE_KUBE_TIMEOUT_MS")?.unwrap_or(DEFAULT_KUBE_TIMEOUT_MS),
            ),
            session: SessionConfig {
                secret: env_opt("SESSIONPLANE_JWT_SECRET").unwrap_or_default(),
                ttl: Duration::from_secs(
                    env_u64("SESSIONPLANE_SESSION_TTL_SECS")?.unwrap_or(DEFAULT_SESSION_TTL_SECS),
                ),
                issuer: env_opt("SESSIONPLANE_ISSUER").unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
                cookie_name: env_opt("SESSIONPLANE_COOKIE_NAME")
                    .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string()),
                same_site,
                force_secure: env_bool("SESSIONPLANE_COOKIE_SECURE")?.unwrap_or(false),
            },
            policy_paths,
            local_users_file: env_opt("SESSIONPLANE_LOCAL_USERS_FILE").map(PathBuf::from),
            ldap: None,
            oidc: None,
            creator_key: env_opt("SESSIONPLANE_CREATOR_KEY"),
            session_resource: env_opt("SESSIONPLANE_SESSION_RESOURCE")
                .unwrap_or_else(|| DEFAULT_SESSION_RESOURCE.to_string()),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = env_opt("SESSIONPLANE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read SESSIONPLANE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ControlPlaneConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse control plane config yaml")?;
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.pod_namespace {
            self.pod_namespace = value;
        }
        if let Some(value) = override_cfg.cluster_wide {
            self.cluster_wide = value;
        }
        if let Some(value) = override_cfg.kube_timeout_ms {
            self.kube_timeout = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.session_secret {
            self.session.secret = value;
        }
        if let Some(value) = override_cfg.session_ttl_secs {
            self.session.ttl = Duration::from_secs(value);
        }
        if let Some(value) = override_cfg.issuer {
            self.session.issuer = value;
        }
        if let Some(value) = override_cfg.cookie_name {
            self.session.cookie_name = value;
        }
        if let Some(value) = override_cfg.cookie_same_site {
            self.session.same_site = value;
        }
        if let Some(value) = override_cfg.cookie_secure {
            self.session.force_secure = value;
        }
        if let Some(value) = override_cfg.policy_paths {
            self.policy_paths = value;
        }
        if let Some(value) = override_cfg.local_users_file {
            self.local_users_file = Some(value);
        }
        if let Some(value) = override_cfg.ldap {
            self.ldap = Some(value);
        }
        if let Some(value) = override_cfg.oidc {
            self.oidc = Some(value);
        }
        if let Some(value) = override_cfg.creator_key {
            self.creator_key = Some(value);
        }
        if let Some(value) = override_cfg.session_resource {
            self.session_resource = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.secret.len() < MIN_SECRET_LEN {
            bail!("session secret must be at least {MIN_SECRET_LEN} bytes (SESSIONPLANE_JWT_SECRET)");
        }
        if self.session.ttl.is_zero() {
            bail!("session ttl must be positive");
        }
        if self.policy_paths.is_empty() {
            bail!("at least one policy file is required (SESSIONPLANE_POLICY_PATHS)");
        }
        if self.session.same_site == SameSiteMode::None && !self.session.force_secure {
            bail!("SameSite=None requires secure cookies (SESSIONPLANE_COOKIE_SECURE)");
        }
        if self.kube_timeout.is_zero() {
            bail!("kubernetes call timeout must be positive");
        }
        self.session_gvk()?;
        Ok(())
    }

    /// Parsed [`session_resource`](Self::session_resource).
    pub fn session_gvk(&self) -> Result<GroupVersionKind> {
        let (group_version, kind) = self
            .session_resource
            .rsplit_once('/')
            .filter(|(_, kind)| !kind.is_empty())
            .with_context(|| {
                format!("session resource {:?} is not <group>/<version>/<Kind>", self.session_resource)
            })?;
        let gv: GroupVersion = group_version
            .parse()
            .with_context(|| format!("parse session resource {:?}", self.session_resource))?;
        Ok(gv.with_kind(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    #[serial]
    fn env_defaults_and_overrides() {
        let _g1 = EnvGuard::set("SESSIONPLANE_JWT_SECRET", SECRET);
        let _g2 = EnvGuard::set("SESSIONPLANE_POLICY_PATHS", "/etc/sp/a.csv, /etc/sp/b.csv");
        let _g3 = EnvGuard::set("POD_NAMESPACE", "ops");
        let _g4 = EnvGuard::set("POD_NAME", "sessionplane-abc");
        let _g5 = EnvGuard::set("SESSIONPLANE_CLUSTER_WIDE", "true");
        let _g6 = EnvGuard::unset("SESSIONPLANE_CONFIG");
        let _g7 = EnvGuard::unset("SESSIONPLANE_SESSION_TTL_SECS");

        let config = ControlPlaneConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.pod_namespace, "ops");
        assert_eq!(config.pod_name.as_deref(), Some("sessionplane-abc"));
        assert!(config.cluster_wide);
        assert_eq!(config.policy_paths.len(), 2);
        assert_eq!(config.session.ttl, Duration::from_secs(DEFAULT_SESSION_TTL_SECS));
        assert_eq!(config.session.same_site, SameSiteMode::Lax);
        assert_eq!(config.session.cookie_name, DEFAULT_COOKIE_NAME);
    }

    #[test]
    #[serial]
    fn short_secret_is_rejected() {
        let _g1 = EnvGuard::set("SESSIONPLANE_JWT_SECRET", "too-short");
        let _g2 = EnvGuard::set("SESSIONPLANE_POLICY_PATHS", "/etc/sp/policy.csv");
        let _g3 = EnvGuard::unset("SESSIONPLANE_CONFIG");
        let err = ControlPlaneConfig::from_env_or_yaml().expect_err("short secret");
        assert!(err.to_string().contains("at least 32 bytes"));
    }

    #[test]
    #[serial]
    fn invalid_bool_is_an_error() {
        let _g1 = EnvGuard::set("SESSIONPLANE_CLUSTER_WIDE", "maybe");
        assert!(ControlPlaneConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _g1 = EnvGuard::unset("SESSIONPLANE_JWT_SECRET");
        let _g2 = EnvGuard::unset("SESSIONPLANE_CLUSTER_WIDE");
        let mut config = ControlPlaneConfig::from_env().expect("env");
        config
            .apply_yaml(&format!(
                r#"
session_secret: "{SECRET}"
bind_addr: "127.0.0.1:9443"
policy_paths: ["/etc/sp/policy.csv"]
cookie_same_site: strict
ldap:
  url: "ldap://ldap.example:389"
  bind_dn_template: "uid={{username}},ou=people,dc=example,dc=org"
  group_roles:
    admins: ["role:admin"]
oidc:
  issuer: "https://idp.example"
  client_id: "sessionplane"
  redirect_url: "https://sp.example/auth/sso/callback"
"#
            ))
            .expect("yaml");
        config.validate().expect("valid");
        assert_eq!(config.bind_addr.port(), 9443);
        assert_eq!(config.session.same_site, SameSiteMode::Strict);
        let ldap = config.ldap.expect("ldap");
        assert_eq!(ldap.group_member_attribute, "member");
        assert_eq!(ldap.group_roles["admins"], vec!["role:admin".to_string()]);
        let oidc = config.oidc.expect("oidc");
        assert!(oidc.pkce);
        assert_eq!(oidc.scopes, default_scopes());
        assert_eq!(oidc.username_claim, "preferred_username");
    }

    #[test]
    #[serial]
    fn session_resource_parses_group_version_kind() {
        let _g1 = EnvGuard::unset("SESSIONPLANE_SESSION_RESOURCE");
        let mut config = ControlPlaneConfig::from_env().expect("env");
        let gvk = config.session_gvk().expect("default");
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("apps", "v1", "Deployment"));

        config.apply_yaml("session_resource: v1/Pod\n").expect("yaml");
        let gvk = config.session_gvk().expect("core group");
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "Pod"));

        config.session_resource = "Deployment".to_string();
        assert!(config.session_gvk().is_err());
        config.session_resource = "apps/v1/".to_string();
        assert!(config.session_gvk().is_err());
    }

    #[test]
    fn same_site_none_requires_secure() {
        let mut config = ControlPlaneConfig::from_env().expect("env");
        config.session.secret = SECRET.to_string();
        config.policy_paths = vec![PathBuf::from("/etc/sp/policy.csv")];
        config.session.same_site = SameSiteMode::None;
        config.session.force_secure = false;
        assert!(config.validate().is_err());
        config.session.force_secure = true;
        config.validate().expect("valid");
    }
}
