#![allow(dead_code)]

use argon2::Params;
use controlplane::app::{AppState, Backends, build_router, build_state};
use controlplane::auth::local::hash_password_with;
use controlplane::config::{
    ControlPlaneConfig, DEFAULT_SESSION_RESOURCE, OidcConfig, SameSiteMode, SessionConfig,
};
use sessionplane_identity::{InMemoryDiscoveryStore, InMemoryManagedObjects, InMemoryOwnerLookup};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const SECRET: &str = "integration-secret-0123456789abcdef";

pub const POLICY: &str = "\
p, role:admin, *, *, *
p, role:viewer, team-a, sessions, list
p, role:viewer, team-a, sessions, get
p, role:editor, team-a, sessions, update
g, role:editor, role:viewer
g, user:local:carol, role:editor
";

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory holding the policy and users files for one test.
pub struct Fixture {
    pub dir: PathBuf,
    pub policy: PathBuf,
    pub users: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = std::env::temp_dir().join(format!(
            "sessionplane-it-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).expect("fixture dir");
        let fixture = Self {
            policy: dir.join("policy.csv"),
            users: dir.join("users.yaml"),
            dir,
        };
        fixture.write_policy(POLICY);
        fixture.write_users(&[
            ("alice", "alice-pw", &["role:admin"]),
            ("bob", "bob-pw", &["role:viewer"]),
            ("carol", "carol-pw", &[]),
        ]);
        fixture
    }

    pub fn write_policy(&self, text: &str) {
        std::fs::write(&self.policy, text).expect("policy");
    }

    pub fn write_users(&self, users: &[(&str, &str, &[&str])]) {
        let mut yaml = String::from("users:\n");
        for (username, password, roles) in users {
            yaml.push_str(&format!(
                "  - username: '{username}'\n    password_hash: '{}'\n    email: '{username}@example.org'\n    roles: [{}]\n",
                cheap_hash(password),
                roles
                    .iter()
                    .map(|role| format!("'{role}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        std::fs::write(&self.users, yaml).expect("users");
    }

    pub fn config(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            bind_addr: "127.0.0.1:0".parse().expect("bind"),
            metrics_bind: "127.0.0.1:0".parse().expect("metrics"),
            pod_namespace: "sessionplane".to_string(),
            pod_name: Some("server-0".to_string()),
            cluster_wide: false,
            kube_timeout: Duration::from_millis(500),
            session: SessionConfig {
                secret: SECRET.to_string(),
                ttl: Duration::from_secs(3600),
                issuer: "sessionplane".to_string(),
                cookie_name: "sessionplane_session".to_string(),
                same_site: SameSiteMode::Lax,
                force_secure: false,
            },
            policy_paths: vec![self.policy.clone()],
            local_users_file: Some(self.users.clone()),
            ldap: None,
            oidc: None,
            creator_key: None,
            session_resource: DEFAULT_SESSION_RESOURCE.to_string(),
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn cheap_hash(password: &str) -> String {
    hash_password_with(Params::new(1024, 1, 1, None).expect("params"), password).expect("hash")
}

pub async fn state_for(config: &ControlPlaneConfig) -> AppState {
    state_with_objects(config, Arc::new(InMemoryManagedObjects::new())).await
}

pub async fn state_with_objects(
    config: &ControlPlaneConfig,
    objects: Arc<InMemoryManagedObjects>,
) -> AppState {
    let backends = Backends {
        owners: Arc::new(InMemoryOwnerLookup::new()),
        discovery: Arc::new(InMemoryDiscoveryStore::new("cluster-uid-1")),
        objects,
    };
    build_state(config, backends).await.expect("state")
}

pub async fn app_for(config: &ControlPlaneConfig) -> axum::Router {
    build_router(state_for(config).await)
}

pub fn oidc_config(issuer: &str) -> OidcConfig {
    OidcConfig {
        issuer: issuer.to_string(),
        client_id: "sessionplane".to_string(),
        client_secret: Some("client-secret".to_string()),
        redirect_url: "https://sessionplane.example/auth/sso/callback".to_string(),
        discovery_url: None,
        scopes: vec!["openid".to_string(), "profile".to_string()],
        pkce: true,
        username_claim: "preferred_username".to_string(),
        roles_claim: Some("groups".to_string()),
        post_logout_redirect_url: Some("https://sessionplane.example/".to_string()),
    }
}

pub mod idp;
