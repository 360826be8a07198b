//! Session resource endpoints.
use crate::api::error::ApiError;
use crate::api::types::{AdoptQuery, AdoptionResponse};
use crate::app::AppState;
use crate::auth::handlers::Session;
use axum::Json;
use axum::extract::{Path, Query, State};
use sessionplane_identity::AdoptionOutcome;

/// `POST /api/v1/namespaces/{namespace}/sessions/{name}/adopt`
///
/// Takes over an orphaned session resource. `?force=true` also claims one
/// whose previous installation may still be running.
pub(crate) async fn adopt_session(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<AdoptQuery>,
    session: Session,
) -> Result<Json<AdoptionResponse>, ApiError> {
    let outcome = state
        .adoption
        .adopt(&session.claims, &namespace, &name, query.force)
        .await?;
    let (adopted, previous) = match outcome {
        AdoptionOutcome::Adopted { previous } => {
            tracing::info!(subject = %session.claims.sub, namespace, name, forced = query.force, "session adopted");
            (true, previous)
        }
        AdoptionOutcome::AlreadyOwned => (false, None),
    };
    Ok(Json(AdoptionResponse {
        instance_id: state.tenancy.instance_id().to_string(),
        adopted,
        previous,
    }))
}
