//! Namespace-scoped authorization for SessionPlane services.
//!
//! # Purpose
//! Answers "can subject S, holding roles R, perform action A on resource kind K
//! within domain D", where D is a namespace or `*` for cluster-wide grants.
//!
//! # How it fits
//! The control plane loads policy files into an [`RbacEngine`] at startup and
//! consults it from every handler after the session has been validated.
//!
//! # Key invariants
//! - Wildcard-domain grants are evaluated before the concrete domain.
//! - Reload builds a complete enforcer off to the side and swaps it in
//!   atomically; a failed reload leaves the previous policy serving.
//! - An empty domain, or a request with no subject and no roles, is denied.
//! - Users and roles never share a name: roles are `role:<name>`, users are
//!   `user:<provider>:<subject>`, and policy lines using anything else are
//!   rejected at load time.
//!
//! # Policy format
//! ```text
//! # p, <subject-or-role>, <domain>, <resource>, <action>
//! p, role:admin, *, *, *
//! p, role:viewer, team-a, sessions, list
//! p, user:oidc:0f9c2e, team-b, sessions, *
//! # g, <member>, <role>
//! g, user:local:alice, role:viewer
//! ```
//!
//! # Examples
//! ```rust
//! use sessionplane_authz::{PolicyDocument, RbacEngine};
//!
//! # async fn demo() -> Result<(), sessionplane_authz::RbacError> {
//! let doc = PolicyDocument::parse("p, role:viewer, team-a, sessions, list")?;
//! let engine = RbacEngine::from_document(doc).await?;
//! assert!(engine.enforce("user:local:bob", &["role:viewer".to_string()], "sessions", "list", "team-a"));
//! assert!(!engine.enforce("user:local:bob", &[], "sessions", "list", "team-a"));
//! # Ok(())
//! # }
//! ```

mod casbin_model;
mod engine;
mod errors;
mod matrix;
mod policy;

pub use casbin_model::{casbin_model, casbin_model_string};
pub use engine::{RbacEngine, ReloadSummary};
pub use errors::{RbacError, RbacResult};
pub use matrix::PermissionMatrix;
pub use policy::{
    GroupingRule, PolicyDocument, PolicyRule, ROLE_PREFIX, USER_PREFIX, WILDCARD, WILDCARD_DOMAIN,
    is_role_name, is_user_principal, user_principal,
};
