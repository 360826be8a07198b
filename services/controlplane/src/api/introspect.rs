//! Permission introspection for the calling user.
use crate::api::error::{ApiError, api_validation_error};
use crate::api::split_list;
use crate::api::types::{IntrospectQuery, IntrospectResponse};
use crate::app::AppState;
use crate::auth::handlers::Session;
use axum::Json;
use axum::extract::{Query, State};

const DEFAULT_RESOURCE: &str = "sessions";
const DEFAULT_ACTIONS: &[&str] = &["list", "get", "create", "update", "delete"];
// Every cell is one policy evaluation.
const MAX_MATRIX_CELLS: usize = 1024;

/// `GET /api/v1/introspect/user`
///
/// Returns the caller's claims, the roles inherited through policy groupings
/// and a resource × domain × action matrix. Domains default to this
/// installation's namespace.
pub(crate) async fn introspect_user(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<IntrospectQuery>,
) -> Result<Json<IntrospectResponse>, ApiError> {
    let claims = session.claims;
    let resource = query
        .resource
        .as_deref()
        .map(str::trim)
        .filter(|resource| !resource.is_empty())
        .unwrap_or(DEFAULT_RESOURCE)
        .to_string();
    let own_namespace = state.tenancy.identity().namespace.clone();
    let domains = split_list(query.namespaces.as_deref(), &[own_namespace.as_str()]);
    let actions = split_list(query.actions.as_deref(), DEFAULT_ACTIONS);
    if domains.len() * actions.len() > MAX_MATRIX_CELLS {
        return Err(api_validation_error(
            "too many namespace and action combinations requested",
        ));
    }

    let mut inherited_roles = state.rbac.roles_of(&claims.sub);
    for role in &claims.roles {
        for inherited in std::iter::once(role.clone()).chain(state.rbac.roles_of(role)) {
            if !inherited_roles.contains(&inherited) {
                inherited_roles.push(inherited);
            }
        }
    }

    let permissions =
        state
            .rbac
            .user_permissions(&claims.sub, &claims.roles, &resource, &domains, &actions);
    Ok(Json(IntrospectResponse {
        policy_version: state.rbac.version(),
        claims,
        inherited_roles,
        permissions,
    }))
}
