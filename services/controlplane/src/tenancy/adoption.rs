//! Adoption of orphaned managed resources.
//!
//! # Purpose
//! Gate [`TenantScope::adopt`] behind an authorization check, apply it to the
//! stored object and translate its outcome into API errors.
//!
//! # Key invariants
//! - The caller needs the cluster-wide `adopt` grant on `sessions`, or
//!   `update` on `sessions` in the resource's namespace. Authorization runs
//!   before the object is read, so denied callers learn nothing about it.
//! - A resource stamped by a live installation, or by any installation while
//!   the discovery index is partial, is only taken with `force`; otherwise the
//!   request fails with 409 `owned_by_other_instance`.
//! - The write carries the resource version that was read; a concurrent
//!   change fails with 409 `concurrent_update` instead of being overwritten.
use crate::api::ADMIN_DOMAIN;
use crate::api::error::{ApiError, api_conflict, api_forbidden};
use crate::auth::claims::Claims;
use chrono::Utc;
use sessionplane_authz::RbacEngine;
use sessionplane_identity::{
    AdoptionError, AdoptionOutcome, AdoptionRequest, DiscoveryStore, ManagedObjectStore,
    TenantScope,
};
use std::sync::Arc;

const ADOPTION_RESOURCE: &str = "sessions";

pub fn authorize_adoption(rbac: &RbacEngine, claims: &Claims, namespace: &str) -> Result<(), ApiError> {
    let allowed = rbac.enforce(&claims.sub, &claims.roles, ADOPTION_RESOURCE, "adopt", ADMIN_DOMAIN)
        || (!namespace.is_empty()
            && rbac.enforce(&claims.sub, &claims.roles, ADOPTION_RESOURCE, "update", namespace));
    if allowed {
        Ok(())
    } else {
        tracing::info!(subject = %claims.sub, namespace, "adoption denied");
        Err(api_forbidden("insufficient permissions"))
    }
}

#[derive(Clone)]
pub struct AdoptionService {
    rbac: Arc<RbacEngine>,
    scope: Arc<TenantScope>,
    discovery: Arc<dyn DiscoveryStore>,
    objects: Arc<dyn ManagedObjectStore>,
}

impl AdoptionService {
    pub fn new(
        rbac: Arc<RbacEngine>,
        scope: Arc<TenantScope>,
        discovery: Arc<dyn DiscoveryStore>,
        objects: Arc<dyn ManagedObjectStore>,
    ) -> Self {
        Self {
            rbac,
            scope,
            discovery,
            objects,
        }
    }

    /// Re-stamp the named resource with this installation's identity on
    /// behalf of `claims`.
    ///
    /// # Errors
    /// - 403 when the caller may not adopt in `namespace`.
    /// - 404 when the resource does not exist.
    /// - 409 `owned_by_other_instance` for an unforced claim on a resource
    ///   that may still be managed elsewhere.
    /// - 409 `concurrent_update` when the resource changed before the write.
    pub async fn adopt(
        &self,
        claims: &Claims,
        namespace: &str,
        name: &str,
        force: bool,
    ) -> Result<AdoptionOutcome, ApiError> {
        authorize_adoption(&self.rbac, claims, namespace)?;

        let mut meta = self.objects.get_meta(namespace, name).await?;
        let index = self.scope.build_index(self.discovery.as_ref()).await;
        let request = AdoptionRequest {
            actor: claims.username.clone(),
            force,
            at: Utc::now(),
        };
        let outcome = match self.scope.adopt(&mut meta, &index, &request) {
            Ok(outcome) => outcome,
            Err(AdoptionError::Conflict { owner }) => {
                tracing::info!(owner = %owner, actor = %claims.username, namespace, name, "adoption conflict");
                metrics::counter!("sessionplane_adoptions_total", "outcome" => "conflict").increment(1);
                return Err(api_conflict(
                    "owned_by_other_instance",
                    "resource may belong to another running installation; retry with force",
                ));
            }
        };
        if let AdoptionOutcome::Adopted { .. } = &outcome {
            self.objects.update_meta(&meta).await?;
            metrics::counter!("sessionplane_adoptions_total", "outcome" => "adopted").increment(1);
        }
        Ok(outcome)
    }
}
