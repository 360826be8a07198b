use crate::anchor::{Anchor, AnchorKind};
use crate::detector::detect_management;
use crate::walker::{ObjectSnapshot, OwnerLookup, OwnershipWalker, WalkOutcome};
use std::sync::Arc;

/// Everything the anchor strategies may consult.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionInput<'a> {
    pub namespace: &'a str,
    pub pod: Option<&'a ObjectSnapshot>,
    pub walk: Option<&'a WalkOutcome>,
}

type Strategy = fn(&ResolutionInput<'_>) -> Option<Anchor>;

/// Anchor strategies in priority order.
pub const ANCHOR_STRATEGIES: &[(&str, Strategy)] = &[
    ("controller-provenance", controller_provenance),
    ("pod-provenance", pod_provenance),
    ("controller-identity", controller_identity),
    ("standalone-pod", standalone_pod),
];

/// First matching strategy wins; otherwise the anchor is unresolved.
pub fn resolve_anchor(input: &ResolutionInput<'_>) -> Anchor {
    for (name, strategy) in ANCHOR_STRATEGIES {
        if let Some(anchor) = strategy(input) {
            tracing::info!(strategy = *name, anchor = %anchor, "instance anchor resolved");
            return anchor;
        }
    }
    tracing::warn!(namespace = input.namespace, "instance anchor unresolved");
    Anchor::unresolved(input.namespace)
}

fn controlled_top<'a>(input: &ResolutionInput<'a>) -> Option<&'a ObjectSnapshot> {
    input
        .walk
        .filter(|walk| walk.has_controller)
        .map(|walk| &walk.top)
}

fn controller_provenance(input: &ResolutionInput<'_>) -> Option<Anchor> {
    let top = controlled_top(input)?;
    let found = detect_management(&top.labels, &top.annotations)?;
    Some(Anchor::new(found.kind, input.namespace, &found.name))
}

fn pod_provenance(input: &ResolutionInput<'_>) -> Option<Anchor> {
    let pod = input.pod?;
    let found = detect_management(&pod.labels, &pod.annotations)?;
    Some(Anchor::new(found.kind, input.namespace, &found.name))
}

fn controller_identity(input: &ResolutionInput<'_>) -> Option<Anchor> {
    let top = controlled_top(input)?;
    let kind = AnchorKind::from_controller_kind(&top.kind)?;
    if top.name.is_empty() {
        return None;
    }
    Some(Anchor::new(kind, input.namespace, &top.name))
}

fn standalone_pod(input: &ResolutionInput<'_>) -> Option<Anchor> {
    let walk = input.walk.filter(|walk| !walk.has_controller)?;
    if walk.top.name.is_empty() {
        return None;
    }
    Some(Anchor::new(AnchorKind::Pod, input.namespace, &walk.top.name))
}

/// The anchor plus the workload the pod's controllers lead to, when that
/// workload is a kind with a stable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub anchor: Anchor,
    pub workload: Option<Anchor>,
}

impl Resolution {
    fn unresolved(namespace: &str) -> Self {
        Self {
            anchor: Anchor::unresolved(namespace),
            workload: None,
        }
    }
}

/// Resolves this process's anchor from its own pod.
pub struct AnchorResolver {
    lookup: Arc<dyn OwnerLookup>,
    namespace: String,
    pod_name: Option<String>,
}

impl AnchorResolver {
    pub fn new(lookup: Arc<dyn OwnerLookup>, namespace: &str, pod_name: Option<String>) -> Self {
        Self {
            lookup,
            namespace: namespace.to_string(),
            pod_name: pod_name.filter(|name| !name.is_empty()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lookup(&self) -> &dyn OwnerLookup {
        self.lookup.as_ref()
    }

    pub async fn detect_anchor(&self) -> Anchor {
        self.resolve().await.anchor
    }

    /// Walk from the own pod and pick an anchor. Never fails; anything that
    /// cannot be read yields an unresolved anchor.
    pub async fn resolve(&self) -> Resolution {
        let Some(pod_name) = self.pod_name.as_deref() else {
            tracing::warn!("pod name unknown; skipping ownership walk");
            return Resolution::unresolved(&self.namespace);
        };

        let pod = match self.lookup.get_pod(&self.namespace, pod_name).await {
            Ok(pod) => pod,
            Err(err) => {
                tracing::warn!(pod = pod_name, error = %err, "unable to read own pod");
                return Resolution::unresolved(&self.namespace);
            }
        };
        let walk = OwnershipWalker::new(self.lookup.clone()).resolve(&pod).await;
        if walk.rbac_limited {
            tracing::warn!(
                kind = %walk.top.kind,
                name = %walk.top.name,
                "ownership walk limited by permissions"
            );
        }
        let input = ResolutionInput {
            namespace: &self.namespace,
            pod: Some(&pod),
            walk: Some(&walk),
        };
        Resolution {
            anchor: resolve_anchor(&input),
            workload: controller_identity(&input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{ARGOCD_INSTANCE_KEY, HELM_RELEASE_NAME_ANNOTATION, MANAGED_BY_LABEL};
    use crate::walker::InMemoryOwnerLookup;
    use crate::walker::fixtures::{controller_ref, deployment_chain, object};

    #[tokio::test]
    async fn controller_provenance_beats_workload_identity() {
        let (pod, lookup) = deployment_chain();
        let mut deployment = object("Deployment", "sessionplane", None);
        deployment
            .labels
            .insert(MANAGED_BY_LABEL.to_string(), "Helm".to_string());
        deployment.annotations.insert(
            HELM_RELEASE_NAME_ANNOTATION.to_string(),
            "codespace".to_string(),
        );
        let lookup = lookup.with_object(deployment);
        let resolver = AnchorResolver::new(Arc::new(lookup), "ops", Some(pod.name.clone()));
        let resolution = resolver.resolve().await;
        assert_eq!(resolution.anchor.to_string(), "helm-release:ops:codespace");
        assert_eq!(
            resolution.workload.map(|w| w.to_string()).as_deref(),
            Some("deployment:ops:sessionplane")
        );
    }

    #[tokio::test]
    async fn pod_provenance_used_when_controller_has_none() {
        let (mut pod, lookup) = deployment_chain();
        pod.labels
            .insert(ARGOCD_INSTANCE_KEY.to_string(), "sessions-prod".to_string());
        let lookup = lookup.with_object(pod.clone());
        let resolver = AnchorResolver::new(Arc::new(lookup), "ops", Some(pod.name.clone()));
        assert_eq!(
            resolver.detect_anchor().await.to_string(),
            "argocd-app:ops:sessions-prod"
        );
    }

    #[tokio::test]
    async fn workload_identity_from_senior_controller() {
        let (pod, lookup) = deployment_chain();
        let resolver = AnchorResolver::new(Arc::new(lookup), "ops", Some(pod.name.clone()));
        assert_eq!(
            resolver.detect_anchor().await.to_string(),
            "deployment:ops:sessionplane"
        );
    }

    #[tokio::test]
    async fn rbac_limited_walk_still_yields_workload_anchor() {
        let (pod, lookup) = deployment_chain();
        let lookup = lookup.forbid_kind("ReplicaSet");
        let resolver = AnchorResolver::new(Arc::new(lookup), "ops", Some(pod.name.clone()));
        assert_eq!(
            resolver.detect_anchor().await.to_string(),
            "deployment:ops:sessionplane"
        );
    }

    #[tokio::test]
    async fn standalone_pod_anchors_on_itself() {
        let pod = object("Pod", "debug-shell", None);
        let lookup = InMemoryOwnerLookup::new().with_object(pod);
        let resolver = AnchorResolver::new(Arc::new(lookup), "ops", Some("debug-shell".into()));
        let resolution = resolver.resolve().await;
        assert_eq!(resolution.anchor.to_string(), "pod:ops:debug-shell");
        assert_eq!(resolution.workload, None);
    }

    #[tokio::test]
    async fn unknown_controller_kind_is_unresolved() {
        let pod = object("Pod", "custom-0", Some(controller_ref("Rollout", "custom")));
        let rollout = object("Rollout", "custom", None);
        let lookup = InMemoryOwnerLookup::new()
            .with_object(pod)
            .with_object(rollout);
        let resolver = AnchorResolver::new(Arc::new(lookup), "ops", Some("custom-0".into()));
        let anchor = resolver.detect_anchor().await;
        assert!(anchor.is_unresolved());
        assert_eq!(anchor.namespace(), "ops");
    }

    #[tokio::test]
    async fn missing_pod_name_is_unresolved() {
        let resolver = AnchorResolver::new(Arc::new(InMemoryOwnerLookup::new()), "ops", None);
        assert!(resolver.detect_anchor().await.is_unresolved());
        let resolver =
            AnchorResolver::new(Arc::new(InMemoryOwnerLookup::new()), "ops", Some("gone".into()));
        assert!(resolver.detect_anchor().await.is_unresolved());
    }

    #[test]
    fn resolve_anchor_without_walk_is_unresolved() {
        let anchor = resolve_anchor(&ResolutionInput {
            namespace: "team-a",
            pod: None,
            walk: None,
        });
        assert_eq!(anchor, Anchor::unresolved("team-a"));
    }
}
