//! HTTP API request/response types.
use crate::auth::claims::Claims;
use sessionplane_authz::PermissionMatrix;
use sessionplane_identity::{Anchor, IdentitySource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthStatus {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: i64,
    pub claims: Claims,
}

#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub instance_id: String,
    pub anchor: Anchor,
    pub namespace: String,
    pub record_name: String,
    pub persisted: bool,
    pub source: IdentitySource,
    pub cluster_wide: bool,
    pub label_selector: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct IntrospectQuery {
    /// Resource kind to build the permission matrix for.
    pub resource: Option<String>,
    /// Comma-separated namespaces.
    pub namespaces: Option<String>,
    /// Comma-separated actions.
    pub actions: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IntrospectResponse {
    pub claims: Claims,
    pub inherited_roles: Vec<String>,
    pub permissions: PermissionMatrix,
    pub policy_version: u64,
}

#[derive(Debug, Serialize)]
pub struct UsersReloadResponse {
    pub users: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct AdoptQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct AdoptionResponse {
    /// The installation that now owns the resource.
    pub instance_id: String,
    /// False when the resource already belonged to this installation.
    pub adopted: bool,
    pub previous: Option<String>,
}
