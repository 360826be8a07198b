//! Authentication HTTP handlers.
//!
//! # Purpose
//! Password login, the federated (OIDC) redirect pair, logout, refresh and
//! session inspection.
//!
//! # Security model
//! - Every login failure answers with the same 401 body; the cause is only
//!   logged by [`AuthManager`](crate::auth::manager::AuthManager).
//! - Session tokens are accepted from an `Authorization: Bearer` header or the
//!   session cookie. The header wins when both are present.
//! - `redirect_to` is restricted to same-origin absolute paths.
use crate::api::error::{ApiError, api_internal, api_unauthorized};
use crate::api::types::{LoginRequest, SessionResponse};
use crate::app::AppState;
use crate::auth::claims::Claims;
use crate::auth::cookies::FLOW_COOKIE_NAME;
use crate::auth::manager::{AuthError, ProviderInfo};
use crate::auth::session_token::IssuedToken;
use axum::Json;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

/// A validated session taken from the request.
#[derive(Debug, Clone)]
pub struct Session {
    pub claims: Claims,
    pub token: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_bearer(&parts.headers)
            .map(str::to_string)
            .or_else(|| {
                CookieJar::from_headers(&parts.headers)
                    .get(state.cookies.session_name())
                    .map(|cookie| cookie.value().to_string())
            })
            .filter(|token| !token.is_empty())
            .ok_or_else(|| api_unauthorized("missing session"))?;
        let claims = state.auth.validate_session(&token)?;
        Ok(Session { claims, token })
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?;
    let value = value.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

fn session_response(issued: IssuedToken) -> SessionResponse {
    SessionResponse {
        token: issued.token,
        expires_at: issued.claims.exp,
        claims: issued.claims,
    }
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<SessionResponse>), ApiError> {
    let issued = state
        .auth
        .login_password(&request.username, &request.password)
        .await?;
    let jar = jar.add(state.cookies.session_cookie(issued.token.clone(), &headers));
    Ok((jar, Json(session_response(issued))))
}

#[derive(Debug, Deserialize, Default)]
pub struct SsoLoginQuery {
    pub redirect_to: Option<String>,
}

/// Accept only same-origin paths; anything else (`//host`, `https://…`,
/// backslash tricks) is dropped.
fn safe_redirect(target: Option<String>) -> Option<String> {
    target.filter(|path| {
        path.starts_with('/') && !path.starts_with("//") && !path.contains('\\')
    })
}

/// `GET /auth/sso/login`
pub async fn sso_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<SsoLoginQuery>,
) -> Result<(CookieJar, Redirect), ApiError> {
    let start = match state.auth.begin_federated(safe_redirect(query.redirect_to)).await {
        Ok(start) => start,
        Err(err @ AuthError::FederatedNotConfigured) => return Err(err.into()),
        Err(err) => {
            return Err(api_internal(
                "sso_unavailable",
                "identity provider unavailable",
                &err,
            ));
        }
    };
    let jar = jar.add(state.cookies.flow_cookie(start.flow_cookie, &headers));
    Ok((jar, Redirect::to(&start.authorization_url)))
}

#[derive(Debug, Deserialize, Default)]
pub struct SsoCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// `GET /auth/sso/callback`
///
/// The flow cookie is cleared on every outcome so a failed attempt cannot be
/// replayed.
pub async fn sso_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<SsoCallbackQuery>,
) -> Response {
    let flow_cookie = jar.get(FLOW_COOKIE_NAME).map(|cookie| cookie.value().to_string());
    let jar = jar.add(state.cookies.clear_flow(&headers));
    let result = state
        .auth
        .complete_federated(
            flow_cookie.as_deref(),
            query.state.as_deref(),
            query.code.as_deref(),
            query.error.as_deref(),
        )
        .await;
    match result {
        Ok(done) => {
            let jar = jar.add(state.cookies.session_cookie(done.session.token, &headers));
            let target = done.redirect_to.unwrap_or_else(|| "/".to_string());
            (jar, Redirect::to(&target)).into_response()
        }
        Err(err) => (jar, ApiError::from(err)).into_response(),
    }
}

/// `POST /auth/logout`
///
/// Always clears the session cookie. Redirects to the identity provider's
/// end-session endpoint when there is one, otherwise answers 204.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Response {
    let jar = jar.add(state.cookies.clear_session(&headers));
    match state.auth.logout_redirect().await {
        Some(url) => (jar, Redirect::to(&url)).into_response(),
        None => (jar, StatusCode::NO_CONTENT).into_response(),
    }
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    session: Session,
) -> Result<(CookieJar, Json<SessionResponse>), ApiError> {
    let issued = state.auth.refresh(&session.token)?;
    let jar = jar.add(state.cookies.session_cookie(issued.token.clone(), &headers));
    Ok((jar, Json(session_response(issued))))
}

/// `GET /auth/me`
pub async fn me(session: Session) -> Json<Claims> {
    Json(session.claims)
}

/// `GET /auth/providers`
pub async fn providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(state.auth.providers())
}
