//! Local username/password accounts backed by a YAML users file.
//!
//! Password hashes are Argon2 PHC strings. Verification runs on the blocking
//! pool, outside the user table lock, and unknown or disabled accounts are
//! checked against a dummy hash so every rejection costs the same.
use crate::auth::claims::{AuthenticatedIdentity, ProviderKind};
use crate::auth::provider::ProviderError;
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const DUMMY_PASSWORD: &[u8] = b"sessionplane-dummy-password";
const DUMMY_SALT: &[u8] = b"sessionplane-timing-salt";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalUser {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<LocalUser>,
}

struct UserTable {
    users: HashMap<String, LocalUser>,
    dummy_hash: String,
}

impl UserTable {
    fn build(users: Vec<LocalUser>) -> Result<Self, ProviderError> {
        let mut table = HashMap::with_capacity(users.len());
        for user in users {
            if user.username.is_empty() {
                return Err(ProviderError::Misconfigured(
                    "local user with empty username".to_string(),
                ));
            }
            PasswordHash::new(&user.password_hash).map_err(|err| {
                ProviderError::Misconfigured(format!(
                    "user {}: invalid password hash: {err}",
                    user.username
                ))
            })?;
            if table.insert(user.username.clone(), user).is_some() {
                return Err(ProviderError::Misconfigured(
                    "duplicate local username".to_string(),
                ));
            }
        }
        let reference = table.values().next().map(|user| user.password_hash.clone());
        let dummy_hash = dummy_hash(reference.as_deref())?;
        Ok(Self {
            users: table,
            dummy_hash,
        })
    }
}

// Hash a throwaway password with the same cost parameters as the stored
// accounts, so the fallback verification takes as long as a real one.
fn dummy_hash(reference: Option<&str>) -> Result<String, ProviderError> {
    let params = reference
        .and_then(|hash| PasswordHash::new(hash).ok())
        .and_then(|hash| Params::try_from(&hash).ok())
        .unwrap_or_default();
    let salt = SaltString::encode_b64(DUMMY_SALT)
        .map_err(|err| ProviderError::Misconfigured(format!("dummy salt: {err}")))?;
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(DUMMY_PASSWORD, &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ProviderError::Misconfigured(format!("dummy hash: {err}")))
}

fn verify_hash(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Hash a password into a PHC string suitable for the users file.
pub fn hash_password_with(params: Params, password: &str) -> Result<String, ProviderError> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ProviderError::Misconfigured(format!("hash password: {err}")))
}

pub struct LocalProvider {
    source: Option<PathBuf>,
    table: RwLock<UserTable>,
}

impl LocalProvider {
    pub fn from_users(users: Vec<LocalUser>) -> Result<Self, ProviderError> {
        Ok(Self {
            source: None,
            table: RwLock::new(UserTable::build(users)?),
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ProviderError> {
        let users = read_users_file(path).await?;
        let table = UserTable::build(users)?;
        tracing::info!(path = %path.display(), users = table.users.len(), "local users loaded");
        Ok(Self {
            source: Some(path.to_path_buf()),
            table: RwLock::new(table),
        })
    }

    /// Re-read the users file. On error the current table is kept.
    pub async fn reload(&self) -> Result<usize, ProviderError> {
        let Some(path) = &self.source else {
            return Err(ProviderError::Misconfigured(
                "local users were not loaded from a file".to_string(),
            ));
        };
        let table = UserTable::build(read_users_file(path).await?)?;
        let count = table.users.len();
        let mut guard = self
            .table
            .write()
            .map_err(|_| ProviderError::Unavailable("local user table poisoned".to_string()))?;
        *guard = table;
        tracing::info!(path = %path.display(), users = count, "local users reloaded");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|table| table.users.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedIdentity, ProviderError> {
        let (candidate, hash) = {
            let table = self
                .table
                .read()
                .map_err(|_| ProviderError::Unavailable("local user table poisoned".to_string()))?;
            match table.users.get(username) {
                Some(user) if !user.disabled => (Some(user.clone()), user.password_hash.clone()),
                _ => (None, table.dummy_hash.clone()),
            }
        };

        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || verify_hash(&hash, &password))
            .await
            .map_err(|err| ProviderError::Unavailable(format!("password verification: {err}")))?;

        match candidate {
            Some(user) if verified => Ok(AuthenticatedIdentity::new(
                ProviderKind::Local,
                &user.username,
                &user.username,
            )
            .with_email(user.email)
            .with_roles(user.roles)),
            _ => Err(ProviderError::InvalidCredentials),
        }
    }
}

async fn read_users_file(path: &Path) -> Result<Vec<LocalUser>, ProviderError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        ProviderError::Unavailable(format!("read {}: {err}", path.display()))
    })?;
    let file: UsersFile = serde_yaml::from_str(&text).map_err(|err| {
        ProviderError::Misconfigured(format!("parse {}: {err}", path.display()))
    })?;
    Ok(file.users)
}
