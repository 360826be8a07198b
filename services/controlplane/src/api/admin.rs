//! Administrative reload endpoints.
//!
//! # Security considerations
//! - Both endpoints require a cluster-scoped (`*` domain) grant: `reload` on
//!   `rbac` or on `users`.
//! - A failed policy reload leaves the previous policy in force; the parse
//!   error is returned to the caller so the operator can fix the file.
use crate::api::ADMIN_DOMAIN;
use crate::api::error::{ApiError, api_forbidden, api_internal, api_not_enabled};
use crate::api::types::UsersReloadResponse;
use crate::app::AppState;
use crate::auth::handlers::Session;
use axum::Json;
use axum::extract::State;
use sessionplane_authz::ReloadSummary;

fn require_admin(state: &AppState, session: &Session, resource: &str) -> Result<(), ApiError> {
    let claims = &session.claims;
    if state
        .rbac
        .enforce(&claims.sub, &claims.roles, resource, "reload", ADMIN_DOMAIN)
    {
        return Ok(());
    }
    tracing::info!(subject = %claims.sub, resource, "admin reload denied");
    Err(api_forbidden("insufficient permissions"))
}

/// `POST /api/v1/admin/rbac/reload`
pub(crate) async fn reload_rbac(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<ReloadSummary>, ApiError> {
    require_admin(&state, &session, "rbac")?;
    let summary = state.rbac.reload().await.map_err(|err| {
        api_internal(
            "reload_failed",
            &format!("policy reload failed, previous policy kept: {err}"),
            &err,
        )
    })?;
    tracing::info!(subject = %session.claims.sub, version = summary.version, "rbac reloaded by admin");
    Ok(Json(summary))
}

/// `POST /api/v1/admin/users/reload`
pub(crate) async fn reload_users(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<UsersReloadResponse>, ApiError> {
    require_admin(&state, &session, "users")?;
    let local = state
        .auth
        .local_provider()
        .ok_or_else(|| api_not_enabled("local users are not configured"))?;
    let users = local.reload().await.map_err(|err| {
        api_internal(
            "reload_failed",
            &format!("users reload failed, previous users kept: {err}"),
            &err,
        )
    })?;
    Ok(Json(UsersReloadResponse { users }))
}
