//! Deployment-tool provenance detection.
//!
//! Argo CD markers are trusted unconditionally. Helm release names are only
//! accepted when corroborated, since `app.kubernetes.io/instance` is a common
//! label that plenty of non-Helm tooling also sets.

use crate::anchor::AnchorKind;
use crate::labels::{
    ARGOCD_INSTANCE_KEY, ARGOCD_TRACKING_ID_ANNOTATION, HELM_CHART_LABEL, HELM_MANAGED_BY_VALUE,
    HELM_RELEASE_NAME_ANNOTATION, K8S_INSTANCE_LABEL, MANAGED_BY_LABEL,
};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMethod {
    GitOps,
    PackageManager,
    Manual,
}

impl DiscoveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryMethod::GitOps => "gitops",
            DiscoveryMethod::PackageManager => "package-manager",
            DiscoveryMethod::Manual => "manual",
        }
    }

    pub fn for_anchor(kind: AnchorKind) -> Self {
        match kind {
            AnchorKind::ArgoApplication => DiscoveryMethod::GitOps,
            AnchorKind::HelmRelease => DiscoveryMethod::PackageManager,
            _ => DiscoveryMethod::Manual,
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementMatch {
    pub kind: AnchorKind,
    pub name: String,
    pub method: DiscoveryMethod,
}

type Labels = BTreeMap<String, String>;
type DetectFn = fn(&Labels, &Labels) -> Option<ManagementMatch>;

const STRATEGIES: &[(&str, DetectFn)] = &[("argocd", detect_argocd), ("helm", detect_helm)];

/// Run the provenance strategies in order; the first match wins.
pub fn detect_management(labels: &Labels, annotations: &Labels) -> Option<ManagementMatch> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let found = strategy(labels, annotations);
        if let Some(found) = &found {
            tracing::debug!(strategy = *name, kind = %found.kind, name = %found.name, "management detected");
        }
        found
    })
}

fn non_empty<'a>(map: &'a Labels, key: &str) -> Option<&'a str> {
    map.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn detect_argocd(labels: &Labels, annotations: &Labels) -> Option<ManagementMatch> {
    let name = non_empty(labels, ARGOCD_INSTANCE_KEY)
        .or_else(|| non_empty(annotations, ARGOCD_INSTANCE_KEY))
        .or_else(|| {
            // <app>:<group>/<kind>:<namespace>/<name>
            non_empty(annotations, ARGOCD_TRACKING_ID_ANNOTATION)
                .and_then(|tracking| tracking.split(':').next())
                .map(str::trim)
                .filter(|app| !app.is_empty())
        })?;
    Some(ManagementMatch {
        kind: AnchorKind::ArgoApplication,
        name: name.to_string(),
        method: DiscoveryMethod::GitOps,
    })
}

fn detect_helm(labels: &Labels, annotations: &Labels) -> Option<ManagementMatch> {
    let corroborated = non_empty(labels, MANAGED_BY_LABEL)
        .map(|value| value.eq_ignore_ascii_case(HELM_MANAGED_BY_VALUE))
        .unwrap_or(false)
        || non_empty(labels, HELM_CHART_LABEL).is_some();
    if !corroborated {
        return None;
    }
    let name = non_empty(annotations, HELM_RELEASE_NAME_ANNOTATION)
        .or_else(|| non_empty(labels, K8S_INSTANCE_LABEL))?;
    Some(ManagementMatch {
        kind: AnchorKind::HelmRelease,
        name: name.to_string(),
        method: DiscoveryMethod::PackageManager,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn argocd_instance_label_is_trusted() {
        let labels = map(&[(ARGOCD_INSTANCE_KEY, "platform")]);
        let found = detect_management(&labels, &Labels::new()).expect("match");
        assert_eq!(found.kind, AnchorKind::ArgoApplication);
        assert_eq!(found.name, "platform");
        assert_eq!(found.method, DiscoveryMethod::GitOps);
    }

    #[test]
    fn argocd_tracking_id_yields_app_name() {
        let annotations = map(&[(
            ARGOCD_TRACKING_ID_ANNOTATION,
            "sessions-prod:apps/Deployment:ops/sessionplane",
        )]);
        let found = detect_management(&Labels::new(), &annotations).expect("match");
        assert_eq!(found.name, "sessions-prod");
    }

    #[test]
    fn argocd_wins_over_helm() {
        let labels = map(&[
            (ARGOCD_INSTANCE_KEY, "gitops-app"),
            (MANAGED_BY_LABEL, "Helm"),
            (K8S_INSTANCE_LABEL, "release"),
        ]);
        let found = detect_management(&labels, &Labels::new()).expect("match");
        assert_eq!(found.kind, AnchorKind::ArgoApplication);
    }

    #[test]
    fn helm_requires_corroboration() {
        let labels = map(&[(K8S_INSTANCE_LABEL, "codespace")]);
        let annotations = map(&[(HELM_RELEASE_NAME_ANNOTATION, "codespace")]);
        assert!(detect_management(&labels, &annotations).is_none());

        let labels = map(&[(K8S_INSTANCE_LABEL, "codespace"), (MANAGED_BY_LABEL, "helm")]);
        let found = detect_management(&labels, &Labels::new()).expect("match");
        assert_eq!(found.kind, AnchorKind::HelmRelease);
        assert_eq!(found.method, DiscoveryMethod::PackageManager);

        let labels = map(&[(HELM_CHART_LABEL, "sessionplane-1.2.0")]);
        let found = detect_management(&labels, &annotations).expect("match");
        assert_eq!(found.name, "codespace");
    }

    #[test]
    fn helm_annotation_preferred_over_instance_label() {
        let labels = map(&[(MANAGED_BY_LABEL, "Helm"), (K8S_INSTANCE_LABEL, "label-name")]);
        let annotations = map(&[(HELM_RELEASE_NAME_ANNOTATION, "release-name")]);
        let found = detect_management(&labels, &annotations).expect("match");
        assert_eq!(found.name, "release-name");
    }

    #[test]
    fn nothing_detected_without_markers() {
        let labels = map(&[("app", "sessionplane"), (MANAGED_BY_LABEL, "kustomize")]);
        assert!(detect_management(&labels, &Labels::new()).is_none());
        let labels = map(&[(ARGOCD_INSTANCE_KEY, "  ")]);
        assert!(detect_management(&labels, &Labels::new()).is_none());
    }
}
