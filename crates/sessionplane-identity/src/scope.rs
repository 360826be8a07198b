//! Tenant scoping of managed resources by instance ID.
//!
//! Non-cluster-wide installations only ever see objects stamped with their own
//! ID. Cluster-wide installations see everything and use the discovery index
//! to attribute foreign objects to the installation that created them.

use crate::anchor::Anchor;
use crate::discovery::{DiscoveryRecord, DiscoveryStore};
use crate::errors::AdoptionError;
use crate::instance::InstanceIdentity;
use crate::labels::{
    ADOPTED_AT_ANNOTATION, ADOPTED_BY_ANNOTATION, ADOPTED_FROM_ANNOTATION, CREATED_BY_ANNOTATION,
    CREATED_BY_SIG_ANNOTATION, INSTANCE_ID_LABEL, MANAGER_KIND_LABEL, MANAGER_NAME_LABEL,
    MANAGER_NAMESPACE_LABEL,
};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Instance ID to anchor, built from discovery records.
///
/// An index built from a scan that could not see the whole cluster is
/// *partial*: an ID missing from it may still belong to a live installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryIndex {
    entries: HashMap<String, Anchor>,
    complete: bool,
}

impl Default for DiscoveryIndex {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            complete: true,
        }
    }
}

impl DiscoveryIndex {
    /// Index a complete set of records. The first record seen for an ID wins.
    pub fn from_records(records: &[DiscoveryRecord]) -> Self {
        let mut index = Self::default();
        for record in records {
            if record.id.is_empty() {
                continue;
            }
            match record.parsed_anchor() {
                Some(anchor) => index.insert(&record.id, anchor),
                None => tracing::debug!(record = %record.name, "skipping record with bad anchor"),
            }
        }
        index
    }

    /// Mark the index as built from an incomplete scan.
    pub fn partial(mut self) -> Self {
        self.complete = false;
        self
    }

    /// False when absence from the index says nothing about liveness.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn insert(&mut self, id: &str, anchor: Anchor) {
        self.entries.entry(id.to_string()).or_insert(anchor);
    }

    pub fn get(&self, id: &str) -> Option<&Anchor> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AdoptionRequest {
    pub actor: String,
    pub force: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdoptionOutcome {
    Adopted { previous: Option<String> },
    AlreadyOwned,
}

pub struct TenantScope {
    identity: InstanceIdentity,
    cluster_wide: bool,
    creator_key: Option<Vec<u8>>,
}

impl TenantScope {
    pub fn new(identity: InstanceIdentity, cluster_wide: bool) -> Self {
        Self {
            identity,
            cluster_wide,
            creator_key: None,
        }
    }

    /// Sign `created-by` annotations with `key`.
    pub fn with_creator_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        self.creator_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn instance_id(&self) -> &str {
        &self.identity.id
    }

    pub fn is_cluster_wide(&self) -> bool {
        self.cluster_wide
    }

    /// Stamp a resource that is about to be created. Not for updates.
    ///
    /// # What it does
    /// Writes the instance ID and manager labels, plus a `created-by`
    /// annotation. With a creator key the annotation is signed; without one
    /// any stale signature is removed.
    pub fn label_new(&self, meta: &mut ObjectMeta, created_by: &str) {
        self.stamp_manager(meta);
        let signature = self.sign_creator(created_by);
        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(CREATED_BY_ANNOTATION.to_string(), created_by.to_string());
        match signature {
            Some(sig) => {
                annotations.insert(CREATED_BY_SIG_ANNOTATION.to_string(), sig);
            }
            None => {
                annotations.remove(CREATED_BY_SIG_ANNOTATION);
            }
        }
    }

    /// True when the `created-by` annotation carries a valid signature from
    /// this installation's key.
    pub fn verify_creator(&self, meta: &ObjectMeta) -> bool {
        let Some(key) = self.creator_key.as_deref() else {
            return false;
        };
        let Some(annotations) = meta.annotations.as_ref() else {
            return false;
        };
        let (Some(created_by), Some(sig)) = (
            annotations.get(CREATED_BY_ANNOTATION),
            annotations.get(CREATED_BY_SIG_ANNOTATION),
        ) else {
            return false;
        };
        let Ok(provided) = hex::decode(sig) else {
            return false;
        };
        let owner = label(meta, INSTANCE_ID_LABEL).unwrap_or_default();
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(creator_payload(owner, created_by).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    /// `instance-id=<id>`, or `None` when cluster-wide.
    pub fn label_selector(&self) -> Option<String> {
        (!self.cluster_wide).then(|| format!("{INSTANCE_ID_LABEL}={}", self.identity.id))
    }

    /// `base` narrowed to this installation's objects. Existing selectors
    /// are kept and joined with the instance selector.
    pub fn list_params(&self, base: ListParams) -> ListParams {
        let Some(selector) = self.label_selector() else {
            return base;
        };
        let combined = match base.label_selector.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{existing},{selector}"),
            _ => selector,
        };
        ListParams {
            label_selector: Some(combined),
            ..base
        }
    }

    pub fn is_visible(&self, meta: &ObjectMeta) -> bool {
        self.cluster_wide || label(meta, INSTANCE_ID_LABEL) == Some(self.identity.id.as_str())
    }

    /// Index every installation visible to this one; always includes itself.
    ///
    /// # What it does
    /// Lists discovery records cluster-wide. When that list is refused the
    /// scan narrows to this installation's namespace and the index is marked
    /// partial (see [`DiscoveryIndex::is_complete`]).
    ///
    /// # Errors
    /// None are returned; scan failures are logged and reflected in the
    /// index's completeness.
    pub async fn build_index(&self, store: &dyn DiscoveryStore) -> DiscoveryIndex {
        let mut index = match store.list_records(None).await {
            Ok(records) => DiscoveryIndex::from_records(&records),
            Err(err) => {
                tracing::warn!(error = %err, "cluster discovery scan failed; using own namespace");
                let records = store
                    .list_records(Some(&self.identity.namespace))
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(error = %err, "namespace discovery scan failed");
                        Vec::new()
                    });
                DiscoveryIndex::from_records(&records).partial()
            }
        };
        index.insert(&self.identity.id, self.identity.anchor.clone());
        index
    }

    /// Backfill missing manager labels on a foreign object. Cluster-wide only;
    /// existing non-empty values are never touched. Returns whether anything
    /// changed.
    pub fn enrich(&self, meta: &mut ObjectMeta, index: &DiscoveryIndex) -> bool {
        if !self.cluster_wide {
            return false;
        }
        let Some(anchor) = label(meta, INSTANCE_ID_LABEL).and_then(|id| index.get(id)) else {
            return false;
        };
        let values = manager_values(anchor);
        let labels = meta.labels.get_or_insert_with(Default::default);
        let mut changed = false;
        for (key, value) in values {
            let slot = labels.entry(key.to_string()).or_default();
            if slot.is_empty() {
                *slot = value;
                changed = true;
            }
        }
        changed
    }

    /// Re-stamp an orphaned resource with this installation's identity.
    ///
    /// # What it does
    /// Overwrites the instance ID and manager labels, and records the previous
    /// owner, the time and the actor in `adopted-*` annotations.
    ///
    /// # Errors
    /// [`AdoptionError::Conflict`] when the resource carries a foreign
    /// instance ID and `request.force` is not set, and either that ID is in
    /// `index` (a live installation) or `index` is partial (liveness unknown).
    pub fn adopt(
        &self,
        meta: &mut ObjectMeta,
        index: &DiscoveryIndex,
        request: &AdoptionRequest,
    ) -> Result<AdoptionOutcome, AdoptionError> {
        let previous = label(meta, INSTANCE_ID_LABEL).map(str::to_string);
        if previous.as_deref() == Some(self.identity.id.as_str()) {
            return Ok(AdoptionOutcome::AlreadyOwned);
        }
        if let Some(owner) = previous.as_deref() {
            let maybe_live = index.contains(owner) || !index.is_complete();
            if maybe_live && !request.force {
                if !index.contains(owner) {
                    tracing::info!(owner, "discovery index is partial; refusing unforced adoption");
                }
                return Err(AdoptionError::Conflict {
                    owner: owner.to_string(),
                });
            }
        }

        self.stamp_manager(meta);
        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(
            ADOPTED_FROM_ANNOTATION.to_string(),
            previous.clone().unwrap_or_default(),
        );
        annotations.insert(
            ADOPTED_AT_ANNOTATION.to_string(),
            request.at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        annotations.insert(ADOPTED_BY_ANNOTATION.to_string(), request.actor.clone());
        tracing::info!(
            previous = previous.as_deref().unwrap_or(""),
            actor = %request.actor,
            forced = request.force,
            "resource adopted"
        );
        Ok(AdoptionOutcome::Adopted { previous })
    }

    fn stamp_manager(&self, meta: &mut ObjectMeta) {
        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(INSTANCE_ID_LABEL.to_string(), self.identity.id.clone());
        for (key, value) in manager_values(&self.identity.anchor) {
            labels.insert(key.to_string(), value);
        }
    }

    fn sign_creator(&self, created_by: &str) -> Option<String> {
        let key = self.creator_key.as_deref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(creator_payload(&self.identity.id, created_by).as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

fn creator_payload(instance_id: &str, created_by: &str) -> String {
    format!("{instance_id}|{created_by}")
}

fn manager_values(anchor: &Anchor) -> [(&'static str, String); 3] {
    [
        (MANAGER_KIND_LABEL, anchor.kind().to_string()),
        (MANAGER_NAMESPACE_LABEL, anchor.namespace().to_string()),
        (MANAGER_NAME_LABEL, anchor.name().to_string()),
    ]
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()?
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}
