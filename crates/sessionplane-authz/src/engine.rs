//! Casbin-backed policy decision point with copy-on-write reload.

use crate::casbin_model::casbin_model;
use crate::errors::RbacResult;
use crate::matrix::PermissionMatrix;
use crate::policy::{PolicyDocument, WILDCARD_DOMAIN, is_role_name, is_user_principal};
use arc_swap::ArcSwap;
use casbin::{CoreApi, Enforcer, MemoryAdapter, MgmtApi};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

struct PolicySet {
    enforcer: Enforcer,
    document: PolicyDocument,
    version: u64,
}

impl PolicySet {
    async fn build(document: PolicyDocument, version: u64) -> RbacResult<Self> {
        // Step 1: Load the embedded Casbin model.
        let model = casbin_model().await?;
        let mut enforcer = Enforcer::new(model, MemoryAdapter::default()).await?;

        // Step 2: Insert grants and role memberships.
        for rule in &document.policies {
            enforcer
                .add_policy(vec![
                    rule.subject.clone(),
                    rule.domain.clone(),
                    rule.resource.clone(),
                    rule.action.clone(),
                ])
                .await?;
        }
        for grouping in &document.groupings {
            enforcer
                .add_grouping_policy(vec![grouping.member.clone(), grouping.role.clone()])
                .await?;
        }

        // Step 3: Build role links after all rules are loaded.
        enforcer.build_role_links()?;
        Ok(Self {
            enforcer,
            document,
            version,
        })
    }

    fn check(&self, subject: &str, domain: &str, resource: &str, action: &str) -> bool {
        match self.enforcer.enforce((subject, domain, resource, action)) {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(error = %err, subject, domain, resource, action, "casbin evaluation failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub version: u64,
    pub policies: usize,
    pub groupings: usize,
}

/// Policy decision point shared by every request handler.
///
/// Readers never block: each decision loads the current policy set through an
/// atomic pointer. Reloads are serialized and swap in a fully built set.
pub struct RbacEngine {
    current: ArcSwap<PolicySet>,
    reload_lock: Mutex<()>,
    sources: Vec<PathBuf>,
}

impl RbacEngine {
    pub async fn from_document(document: PolicyDocument) -> RbacResult<Self> {
        Self::build(document, Vec::new()).await
    }

    /// Load policy files and compile the first policy set.
    ///
    /// # What it does
    /// Merges `sources` in order, builds the Casbin enforcer and remembers the
    /// paths so [`RbacEngine::reload`] can re-read them.
    ///
    /// # Errors
    /// - Any [`crate::RbacError`] from reading, parsing or compiling the policy.
    ///   Callers treat this as fatal at startup.
    pub async fn load(sources: Vec<PathBuf>) -> RbacResult<Self> {
        let document = PolicyDocument::load_files(&sources).await?;
        Self::build(document, sources).await
    }

    async fn build(document: PolicyDocument, sources: Vec<PathBuf>) -> RbacResult<Self> {
        let set = PolicySet::build(document, 1).await?;
        tracing::info!(
            policies = set.document.policies.len(),
            groupings = set.document.groupings.len(),
            "rbac policy loaded"
        );
        Ok(Self {
            current: ArcSwap::from_pointee(set),
            reload_lock: Mutex::new(()),
            sources,
        })
    }

    /// Re-read the configured policy files.
    ///
    /// # What it does
    /// Builds a new policy set beside the live one and swaps it in only when
    /// the build succeeds. Concurrent reloads run one at a time.
    ///
    /// # Errors
    /// - The load or compile error; the previous policy keeps serving and the
    ///   failure is counted in `sessionplane_rbac_reloads_total`.
    pub async fn reload(&self) -> RbacResult<ReloadSummary> {
        let _guard = self.reload_lock.lock().await;
        let result = match PolicyDocument::load_files(&self.sources).await {
            Ok(document) => self.swap(document).await,
            Err(err) => Err(err),
        };
        record_reload(&result);
        result
    }

    /// Swap in an explicit document.
    pub async fn replace(&self, document: PolicyDocument) -> RbacResult<ReloadSummary> {
        let _guard = self.reload_lock.lock().await;
        let result = self.swap(document).await;
        record_reload(&result);
        result
    }

    async fn swap(&self, document: PolicyDocument) -> RbacResult<ReloadSummary> {
        let version = self.current.load().version + 1;
        let set = PolicySet::build(document, version).await?;
        let summary = ReloadSummary {
            version,
            policies: set.document.policies.len(),
            groupings: set.document.groupings.len(),
        };
        self.current.store(Arc::new(set));
        tracing::info!(version, policies = summary.policies, "rbac policy reloaded");
        Ok(summary)
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Decide whether `subject` or any of `roles` may perform `action` on
    /// `resource` in `domain`.
    ///
    /// Wildcard-domain grants are checked first and short-circuit.
    ///
    /// `subject` only counts when it is a `user:<provider>:<subject>`
    /// principal and each role only when it is a `role:<name>`; anything
    /// else is ignored, so a user can never be evaluated as a role.
    pub fn enforce(
        &self,
        subject: &str,
        roles: &[String],
        resource: &str,
        action: &str,
        domain: &str,
    ) -> bool {
        let allowed = self.decide(subject, roles, resource, action, domain);
        metrics::counter!(
            "sessionplane_rbac_decisions_total",
            "outcome" => if allowed { "allow" } else { "deny" }
        )
        .increment(1);
        if !allowed {
            tracing::debug!(subject, resource, action, domain, "rbac denied");
        }
        allowed
    }

    fn decide(
        &self,
        subject: &str,
        roles: &[String],
        resource: &str,
        action: &str,
        domain: &str,
    ) -> bool {
        if domain.is_empty() {
            return false;
        }
        let principal = Some(subject).filter(|subject| is_user_principal(subject));
        let subjects: Vec<&str> = principal
            .into_iter()
            .chain(
                roles
                    .iter()
                    .map(String::as_str)
                    .filter(|role| is_role_name(role)),
            )
            .collect();
        if subjects.is_empty() {
            return false;
        }

        let set = self.current.load();
        let domains: &[&str] = if domain == WILDCARD_DOMAIN {
            &[WILDCARD_DOMAIN]
        } else {
            &[WILDCARD_DOMAIN, domain]
        };
        domains.iter().any(|dom| {
            subjects
                .iter()
                .any(|sub| set.check(sub, dom, resource, action))
        })
    }

    pub fn can_access_namespace(&self, subject: &str, roles: &[String], namespace: &str) -> bool {
        self.enforce(subject, roles, "namespaces", "list", namespace)
    }

    /// Evaluate every `domain` x `action` pair for one resource kind.
    pub fn user_permissions(
        &self,
        subject: &str,
        roles: &[String],
        resource: &str,
        domains: &[String],
        actions: &[String],
    ) -> PermissionMatrix {
        let mut matrix = PermissionMatrix::new(resource);
        for domain in domains {
            for action in actions {
                let allowed = self.decide(subject, roles, resource, action, domain);
                matrix.set(domain, action, allowed);
            }
        }
        matrix
    }

    /// Roles `subject` inherits through `g` lines in the current policy.
    pub fn roles_of(&self, subject: &str) -> Vec<String> {
        self.current.load().document.roles_of(subject)
    }
}

fn record_reload(result: &RbacResult<ReloadSummary>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(err) => {
            tracing::error!(error = %err, "rbac reload failed; keeping previous policy");
            "failure"
        }
    };
    metrics::counter!("sessionplane_rbac_reloads_total", "outcome" => outcome).increment(1);
}
