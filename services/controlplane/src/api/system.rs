//! System/health API handlers.
//!
//! # Purpose and responsibility
//! Liveness endpoint and a read-only view of this installation's identity.
//!
//! # Key invariants and assumptions
//! - Health checks must be fast and side-effect free.
//! - The identity view reflects the identity resolved at startup; it never
//!   triggers another discovery walk.
//!
//! # Security considerations
//! - The identity endpoint reveals deployment metadata and requires a session.
use crate::api::types::{HealthStatus, IdentityResponse};
use crate::app::AppState;
use crate::auth::handlers::Session;
use axum::Json;
use axum::extract::State;

/// Return control-plane health status.
///
/// # Errors
/// - Does not return errors.
pub(crate) async fn system_health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
    })
}

/// Return the instance identity and tenant scope mode.
///
/// # What it does
/// Exposes the instance ID, its anchor, whether the discovery record was
/// persisted, and the label selector applied to list calls.
///
/// # Errors
/// - 401 without a valid session.
pub(crate) async fn system_identity(
    State(state): State<AppState>,
    _session: Session,
) -> Json<IdentityResponse> {
    let identity = state.tenancy.identity();
    Json(IdentityResponse {
        instance_id: identity.id.clone(),
        anchor: identity.anchor.clone(),
        namespace: identity.namespace.clone(),
        record_name: identity.record_name.clone(),
        persisted: identity.persisted,
        source: identity.source,
        cluster_wide: state.tenancy.is_cluster_wide(),
        label_selector: state.tenancy.label_selector(),
        warnings: identity.warnings.clone(),
    })
}
