//! Installation identity primitives shared by SessionPlane services.
//!
//! # Purpose
//! Answers "which installation manages this object": the running pod's
//! ownership chain and deployment-tool provenance are reduced to an [`Anchor`],
//! the anchor is hashed with the cluster UID into a stable instance ID, and the
//! ID is persisted in a discovery record so restarts reuse it.
//!
//! # How it fits
//! The control-plane service resolves its [`InstanceIdentity`] once at startup
//! and hands it to a [`TenantScope`], which stamps, filters and enriches managed
//! resources so coexisting installations stay out of each other's way.
//!
//! # Key invariants
//! - Instance IDs are `i1-` followed by 40 lowercase hex characters.
//! - An ID stored in an existing discovery record is never replaced.
//! - Discovery never fails the caller; it degrades to an in-memory identity.
//!
//! # Examples
//! ```rust
//! use sessionplane_identity::{Anchor, AnchorKind, derive_instance_id};
//!
//! let anchor = Anchor::new(AnchorKind::HelmRelease, "ops", "codespace");
//! let id = derive_instance_id("abc123", &anchor);
//! assert!(id.starts_with("i1-"));
//! assert_eq!(id.len(), 43);
//! ```

mod anchor;
mod detector;
mod discovery;
mod errors;
mod instance;
pub mod kube_backend;
pub mod labels;
mod objects;
mod resolver;
mod scope;
mod walker;

pub use anchor::{Anchor, AnchorKind, MAX_LABEL_VALUE_LEN, sanitize_label_value};
pub use detector::{DiscoveryMethod, ManagementMatch, detect_management};
pub use discovery::{
    DiscoveryRecord, DiscoveryStore, InMemoryDiscoveryStore, discovery_record_name,
    discovery_selector,
};
pub use errors::{AdoptionError, DiscoveryError, LookupError};
pub use instance::{
    INSTANCE_ID_PREFIX, IdentitySource, InstanceIdentity, InstanceIdentityService,
    derive_instance_id,
};
pub use objects::{InMemoryManagedObjects, ManagedObjectStore};
pub use resolver::{ANCHOR_STRATEGIES, AnchorResolver, Resolution, ResolutionInput, resolve_anchor};
pub use scope::{AdoptionOutcome, AdoptionRequest, DiscoveryIndex, TenantScope};
pub use walker::{InMemoryOwnerLookup, MAX_OWNER_HOPS, ObjectSnapshot, OwnerLookup, OwnershipWalker, WalkOutcome};
