//! Control-plane HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and assembles the shared
//! application state injected into handlers.
//!
//! # Notes
//! Startup order matters: the instance identity is resolved before the tenant
//! scope is built, and a policy that fails to load aborts startup.
use crate::api;
use crate::auth;
use crate::auth::cookies::CookiePolicy;
use crate::auth::directory::DirectoryProvider;
use crate::auth::flow::{DEFAULT_FLOW_TTL, FlowCodec};
use crate::auth::local::LocalProvider;
use crate::auth::manager::AuthManager;
use crate::auth::oidc::OidcProvider;
use crate::auth::provider::CredentialProvider;
use crate::auth::session_token::SessionTokens;
use crate::config::ControlPlaneConfig;
use crate::observability;
use crate::tenancy::AdoptionService;
use anyhow::Context;
use axum::Router;
use sessionplane_authz::RbacEngine;
use sessionplane_identity::{
    AnchorResolver, DiscoveryStore, InstanceIdentityService, ManagedObjectStore, OwnerLookup,
    TenantScope,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Cluster access behind the control plane: real Kubernetes clients in
/// production, in-memory stand-ins in tests and when no cluster is reachable.
pub struct Backends {
    pub owners: Arc<dyn OwnerLookup>,
    pub discovery: Arc<dyn DiscoveryStore>,
    pub objects: Arc<dyn ManagedObjectStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub rbac: Arc<RbacEngine>,
    pub tenancy: Arc<TenantScope>,
    pub adoption: AdoptionService,
    pub cookies: CookiePolicy,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri().path(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route(
            "/v1/system/health",
            axum::routing::get(api::system::system_health),
        )
        .route(
            "/api/v1/system/identity",
            axum::routing::get(api::system::system_identity),
        )
        .route("/auth/login", axum::routing::post(auth::handlers::login))
        .route(
            "/auth/sso/login",
            axum::routing::get(auth::handlers::sso_login),
        )
        .route(
            "/auth/sso/callback",
            axum::routing::get(auth::handlers::sso_callback),
        )
        .route("/auth/logout", axum::routing::post(auth::handlers::logout))
        .route("/auth/refresh", axum::routing::post(auth::handlers::refresh))
        .route("/auth/me", axum::routing::get(auth::handlers::me))
        .route(
            "/auth/providers",
            axum::routing::get(auth::handlers::providers),
        )
        .route(
            "/api/v1/introspect/user",
            axum::routing::get(api::introspect::introspect_user),
        )
        .route(
            "/api/v1/admin/rbac/reload",
            axum::routing::post(api::admin::reload_rbac),
        )
        .route(
            "/api/v1/admin/users/reload",
            axum::routing::post(api::admin::reload_users),
        )
        .route(
            "/api/v1/namespaces/:namespace/sessions/:name/adopt",
            axum::routing::post(api::sessions::adopt_session),
        )
        .layer(trace_layer)
        .with_state(state)
}

/// Assemble the application state from configuration and the Kubernetes
/// backends (or in-memory stand-ins).
///
/// # Errors
/// - Policy files that cannot be read or parsed.
/// - Provider configuration that is invalid (bad users file, bind DN
///   template without `{username}`, short session secret).
///
/// Identity discovery never fails here; persistence problems surface as
/// warnings on the resolved identity.
pub async fn build_state(config: &ControlPlaneConfig, backends: Backends) -> anyhow::Result<AppState> {
    let Backends {
        owners,
        discovery,
        objects,
    } = backends;
    let resolver = AnchorResolver::new(owners, &config.pod_namespace, config.pod_name.clone());
    let identity = InstanceIdentityService::new(resolver, discovery.clone(), config.kube_timeout);
    let resolved = identity.ensure().await.clone();
    observability::record_instance_id(&resolved.id);
    if !resolved.persisted {
        tracing::warn!(
            instance_id = %resolved.id,
            "instance identity is not persisted; tenant isolation is not guaranteed"
        );
    }
    tracing::info!(
        instance_id = %resolved.id,
        anchor = %resolved.anchor,
        source = resolved.source.as_str(),
        cluster_wide = config.cluster_wide,
        "instance identity resolved"
    );
    let mut scope = TenantScope::new(resolved, config.cluster_wide);
    if let Some(key) = &config.creator_key {
        scope = scope.with_creator_key(key.as_bytes());
    }
    let tenancy = Arc::new(scope);

    let rbac = Arc::new(
        RbacEngine::load(config.policy_paths.clone())
            .await
            .context("load rbac policy")?,
    );

    let secret = config.session.secret.as_bytes();
    let tokens = SessionTokens::new(secret, &config.session.issuer, config.session.ttl)
        .context("session token signer")?;
    let mut manager = AuthManager::new(tokens, FlowCodec::new(secret, DEFAULT_FLOW_TTL));
    if let Some(path) = &config.local_users_file {
        let local = LocalProvider::load(path)
            .await
            .with_context(|| format!("load local users from {}", path.display()))?;
        manager.register(CredentialProvider::Local(local))?;
    }
    if let Some(ldap) = &config.ldap {
        let directory = DirectoryProvider::from_config(ldap).context("directory provider")?;
        manager.register(CredentialProvider::Directory(directory))?;
    }
    if let Some(oidc) = &config.oidc {
        let oidc = OidcProvider::new(oidc.clone()).context("oidc provider")?;
        manager.register(CredentialProvider::Federated(oidc))?;
    }
    if manager.providers().is_empty() {
        tracing::warn!("no credential providers configured; every login will be rejected");
    }

    Ok(AppState {
        auth: Arc::new(manager),
        adoption: AdoptionService::new(rbac.clone(), tenancy.clone(), discovery, objects),
        rbac,
        tenancy,
        cookies: CookiePolicy::new(&config.session, DEFAULT_FLOW_TTL),
    })
}
