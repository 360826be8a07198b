//! Controller ownership walk from the running pod to its most senior owner.

use crate::errors::LookupError;
use crate::labels::POD_TEMPLATE_HASH_LABEL;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on owner-reference hops; guards against reference cycles.
pub const MAX_OWNER_HOPS: usize = 10;

/// The slice of an object the walker and resolver care about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSnapshot {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectSnapshot {
    pub fn from_meta(kind: &str, api_version: &str, meta: &ObjectMeta) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            owner_references: meta.owner_references.clone().unwrap_or_default(),
        }
    }

    /// Kind and name from an owner reference, with nothing else known.
    pub fn reference_only(namespace: &str, owner: &OwnerReference) -> Self {
        Self {
            kind: owner.kind.clone(),
            api_version: owner.api_version.clone(),
            name: owner.name.clone(),
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    /// The owner reference flagged `controller: true`, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|owner| matches!(owner.controller, Some(true)))
    }
}

/// Read access to pods and arbitrary owner objects.
///
/// # Errors
/// [`LookupError::NotFound`] and [`LookupError::Forbidden`] are expected
/// answers that end an ownership walk; any other error ends it at the
/// reference that could not be read.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<ObjectSnapshot, LookupError>;

    async fn get_owner(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<ObjectSnapshot, LookupError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkOutcome {
    pub top: ObjectSnapshot,
    pub has_controller: bool,
    pub rbac_limited: bool,
    pub hops: usize,
}

pub struct OwnershipWalker {
    lookup: Arc<dyn OwnerLookup>,
}

impl OwnershipWalker {
    pub fn new(lookup: Arc<dyn OwnerLookup>) -> Self {
        Self { lookup }
    }

    /// Follow controller references upward from `pod`.
    ///
    /// Never fails: permission denial and missing objects end the walk with
    /// whatever was last known about the chain. When the pod's own
    /// ReplicaSet cannot be read (forbidden, or already garbage collected
    /// during a rollout) the Deployment is inferred from the
    /// `pod-template-hash` suffix.
    pub async fn resolve(&self, pod: &ObjectSnapshot) -> WalkOutcome {
        let Some(first) = pod.controller() else {
            return WalkOutcome {
                top: pod.clone(),
                has_controller: false,
                rbac_limited: false,
                hops: 0,
            };
        };

        let namespace = pod.namespace.as_str();
        let mut reference = first.clone();
        let mut current = pod.clone();
        let mut hops = 0;
        loop {
            if hops >= MAX_OWNER_HOPS {
                tracing::warn!(hops, kind = %current.kind, name = %current.name, "owner walk hit hop limit");
                return finished(current, false, hops);
            }
            hops += 1;
            match self.lookup.get_owner(namespace, &reference).await {
                Ok(owner) => {
                    tracing::debug!(hop = hops, kind = %owner.kind, name = %owner.name, "owner resolved");
                    let next = owner.controller().cloned();
                    current = owner;
                    match next {
                        Some(next) => reference = next,
                        None => return finished(current, false, hops),
                    }
                }
                Err(LookupError::Forbidden) => {
                    tracing::warn!(
                        kind = %reference.kind,
                        name = %reference.name,
                        "owner lookup forbidden; identity resolution is rbac limited"
                    );
                    return finished(last_known(pod, &reference, hops), true, hops);
                }
                Err(LookupError::NotFound) => {
                    tracing::warn!(kind = %reference.kind, name = %reference.name, "owner not found");
                    return finished(last_known(pod, &reference, hops), false, hops);
                }
                Err(err) => {
                    tracing::warn!(kind = %reference.kind, name = %reference.name, error = %err, "owner lookup failed");
                    return finished(ObjectSnapshot::reference_only(namespace, &reference), false, hops);
                }
            }
        }
    }
}

fn finished(top: ObjectSnapshot, rbac_limited: bool, hops: usize) -> WalkOutcome {
    WalkOutcome {
        top,
        has_controller: true,
        rbac_limited,
        hops,
    }
}

/// Best guess at the top of the chain when `reference` could not be read.
fn last_known(pod: &ObjectSnapshot, reference: &OwnerReference, hops: usize) -> ObjectSnapshot {
    let inferred = if hops == 1 {
        infer_deployment(pod, reference)
    } else {
        None
    };
    inferred.unwrap_or_else(|| ObjectSnapshot::reference_only(&pod.namespace, reference))
}

/// An unreadable ReplicaSet named `<deployment>-<pod-template-hash>` still
/// tells us the Deployment name.
fn infer_deployment(pod: &ObjectSnapshot, reference: &OwnerReference) -> Option<ObjectSnapshot> {
    if reference.kind != "ReplicaSet" {
        return None;
    }
    let hash = pod.labels.get(POD_TEMPLATE_HASH_LABEL)?;
    let name = reference.name.strip_suffix(&format!("-{hash}"))?;
    if name.is_empty() {
        return None;
    }
    Some(ObjectSnapshot {
        kind: "Deployment".to_string(),
        api_version: "apps/v1".to_string(),
        name: name.to_string(),
        namespace: pod.namespace.clone(),
        ..ObjectSnapshot::default()
    })
}

/// Owner lookup over a fixed object set, for tests and dry runs.
#[derive(Default)]
pub struct InMemoryOwnerLookup {
    objects: HashMap<(String, String, String), ObjectSnapshot>,
    forbidden: HashSet<(String, String)>,
    calls: AtomicUsize,
}

impl InMemoryOwnerLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, object: ObjectSnapshot) -> Self {
        let key = (
            object.namespace.clone(),
            object.kind.clone(),
            object.name.clone(),
        );
        self.objects.insert(key, object);
        self
    }

    /// Every lookup of `kind` answers forbidden.
    pub fn forbid_kind(mut self, kind: &str) -> Self {
        self.forbidden.insert((kind.to_string(), String::new()));
        self
    }

    pub fn forbid(mut self, kind: &str, name: &str) -> Self {
        self.forbidden.insert((kind.to_string(), name.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fetch(&self, namespace: &str, kind: &str, name: &str) -> Result<ObjectSnapshot, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.forbidden.contains(&(kind.to_string(), String::new()))
            || self.forbidden.contains(&(kind.to_string(), name.to_string()))
        {
            return Err(LookupError::Forbidden);
        }
        self.objects
            .get(&(namespace.to_string(), kind.to_string(), name.to_string()))
            .cloned()
            .ok_or(LookupError::NotFound)
    }
}

#[async_trait]
impl OwnerLookup for InMemoryOwnerLookup {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<ObjectSnapshot, LookupError> {
        self.fetch(namespace, "Pod", name)
    }

    async fn get_owner(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<ObjectSnapshot, LookupError> {
        self.fetch(namespace, &owner.kind, &owner.name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn controller_ref(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: match kind {
                "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" => "apps/v1",
                "Job" | "CronJob" => "batch/v1",
                _ => "v1",
            }
            .to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(true),
            ..OwnerReference::default()
        }
    }

    pub fn object(kind: &str, name: &str, owner: Option<OwnerReference>) -> ObjectSnapshot {
        ObjectSnapshot {
            kind: kind.to_string(),
            api_version: "v1".to_string(),
            name: name.to_string(),
            namespace: "ops".to_string(),
            owner_references: owner.into_iter().collect(),
            ..ObjectSnapshot::default()
        }
    }

    /// Pod -> ReplicaSet -> Deployment chain in namespace `ops`.
    pub fn deployment_chain() -> (ObjectSnapshot, InMemoryOwnerLookup) {
        let mut pod = object(
            "Pod",
            "sessionplane-7d9f8c-abcde",
            Some(controller_ref("ReplicaSet", "sessionplane-7d9f8c")),
        );
        pod.labels
            .insert(POD_TEMPLATE_HASH_LABEL.to_string(), "7d9f8c".to_string());
        let rs = object(
            "ReplicaSet",
            "sessionplane-7d9f8c",
            Some(controller_ref("Deployment", "sessionplane")),
        );
        let deployment = object("Deployment", "sessionplane", None);
        let lookup = InMemoryOwnerLookup::new()
            .with_object(pod.clone())
            .with_object(rs)
            .with_object(deployment);
        (pod, lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn walks_replicaset_to_deployment() {
        let (pod, lookup) = deployment_chain();
        let walker = OwnershipWalker::new(Arc::new(lookup));
        let outcome = walker.resolve(&pod).await;
        assert_eq!(outcome.top.kind, "Deployment");
        assert_eq!(outcome.top.name, "sessionplane");
        assert!(outcome.has_controller);
        assert!(!outcome.rbac_limited);
        assert_eq!(outcome.hops, 2);
    }

    #[tokio::test]
    async fn walks_job_to_cronjob() {
        let pod = object("Pod", "backup-123-xyz", Some(controller_ref("Job", "backup-123")));
        let job = object("Job", "backup-123", Some(controller_ref("CronJob", "backup")));
        let cron = object("CronJob", "backup", None);
        let lookup = InMemoryOwnerLookup::new().with_object(job).with_object(cron);
        let outcome = OwnershipWalker::new(Arc::new(lookup)).resolve(&pod).await;
        assert_eq!(outcome.top.kind, "CronJob");
        assert_eq!(outcome.top.name, "backup");
    }

    #[tokio::test]
    async fn pod_without_controller_is_its_own_top() {
        let pod = object("Pod", "standalone", None);
        let outcome = OwnershipWalker::new(Arc::new(InMemoryOwnerLookup::new()))
            .resolve(&pod)
            .await;
        assert_eq!(outcome.top, pod);
        assert!(!outcome.has_controller);
        assert_eq!(outcome.hops, 0);
    }

    #[tokio::test]
    async fn forbidden_replicaset_infers_deployment_from_hash() {
        let (pod, lookup) = deployment_chain();
        let lookup = lookup.forbid_kind("ReplicaSet");
        let outcome = OwnershipWalker::new(Arc::new(lookup)).resolve(&pod).await;
        assert!(outcome.rbac_limited);
        assert_eq!(outcome.top.kind, "Deployment");
        assert_eq!(outcome.top.name, "sessionplane");
        assert!(outcome.top.labels.is_empty());
    }

    #[tokio::test]
    async fn missing_replicaset_infers_deployment_from_hash() {
        let (pod, _) = deployment_chain();
        let lookup = InMemoryOwnerLookup::new().with_object(pod.clone());
        let outcome = OwnershipWalker::new(Arc::new(lookup)).resolve(&pod).await;
        assert!(!outcome.rbac_limited);
        assert_eq!(outcome.hops, 1);
        assert_eq!(outcome.top.kind, "Deployment");
        assert_eq!(outcome.top.name, "sessionplane");
    }

    #[tokio::test]
    async fn missing_replicaset_without_hash_label_keeps_reference() {
        let (mut pod, _) = deployment_chain();
        pod.labels.clear();
        let outcome = OwnershipWalker::new(Arc::new(InMemoryOwnerLookup::new()))
            .resolve(&pod)
            .await;
        assert_eq!(outcome.top.kind, "ReplicaSet");
        assert_eq!(outcome.top.name, "sessionplane-7d9f8c");
    }

    #[tokio::test]
    async fn forbidden_deployment_reports_last_known_reference() {
        let (pod, lookup) = deployment_chain();
        let lookup = lookup.forbid_kind("Deployment");
        let outcome = OwnershipWalker::new(Arc::new(lookup)).resolve(&pod).await;
        assert!(outcome.rbac_limited);
        assert_eq!(outcome.top.kind, "Deployment");
        assert_eq!(outcome.top.name, "sessionplane");
        assert!(outcome.top.annotations.is_empty());
    }

    #[tokio::test]
    async fn missing_owner_stops_without_flag() {
        let pod = object("Pod", "orphan", Some(controller_ref("StatefulSet", "gone")));
        let outcome = OwnershipWalker::new(Arc::new(InMemoryOwnerLookup::new()))
            .resolve(&pod)
            .await;
        assert!(!outcome.rbac_limited);
        assert!(outcome.has_controller);
        assert_eq!(outcome.top.kind, "StatefulSet");
        assert_eq!(outcome.top.name, "gone");
    }

    #[tokio::test]
    async fn reference_cycle_is_bounded() {
        let pod = object("Pod", "loop-pod", Some(controller_ref("Widget", "a")));
        let a = object("Widget", "a", Some(controller_ref("Widget", "b")));
        let b = object("Widget", "b", Some(controller_ref("Widget", "a")));
        let lookup = Arc::new(InMemoryOwnerLookup::new().with_object(a).with_object(b));
        let outcome = OwnershipWalker::new(lookup.clone()).resolve(&pod).await;
        assert_eq!(outcome.hops, MAX_OWNER_HOPS);
        assert_eq!(lookup.calls(), MAX_OWNER_HOPS);
        assert!(!outcome.rbac_limited);
    }
}
