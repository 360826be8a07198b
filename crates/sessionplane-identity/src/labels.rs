//! Label and annotation keys written or read by the identity subsystem.
//!
//! Managed resources carry [`INSTANCE_ID_LABEL`] plus the manager labels and
//! the `created-by`/`adopted-*` annotations. Discovery records are ConfigMaps
//! selected by the `app.kubernetes.io` part-of/component pair and hold their
//! payload under the `RECORD_*` data keys. Anchor names used as label values
//! are already sanitized by [`crate::Anchor::new`].

/// Instance ID of the installation that created (or adopted) a resource.
pub const INSTANCE_ID_LABEL: &str = "sessionplane.io/instance-id";
pub const MANAGER_KIND_LABEL: &str = "sessionplane.io/manager-kind";
pub const MANAGER_NAMESPACE_LABEL: &str = "sessionplane.io/manager-namespace";
pub const MANAGER_NAME_LABEL: &str = "sessionplane.io/manager-name";

pub const CREATED_BY_ANNOTATION: &str = "sessionplane.io/created-by";
pub const CREATED_BY_SIG_ANNOTATION: &str = "sessionplane.io/created-by.sig";
pub const ADOPTED_FROM_ANNOTATION: &str = "sessionplane.io/adopted-from";
pub const ADOPTED_AT_ANNOTATION: &str = "sessionplane.io/adopted-at";
pub const ADOPTED_BY_ANNOTATION: &str = "sessionplane.io/adopted-by";

// Discovery record labels.
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const PART_OF_VALUE: &str = "sessionplane";
pub const MANAGED_BY_VALUE: &str = "sessionplane";
pub const COMPONENT_SERVER: &str = "server";
pub const DISCOVERY_METHOD_LABEL: &str = "sessionplane.io/discovery-method";
pub const ARGOCD_APP_LABEL: &str = "sessionplane.io/argocd-app";
pub const HELM_RELEASE_LABEL: &str = "sessionplane.io/helm-release";
pub const WORKLOAD_NAME_LABEL: &str = "sessionplane.io/workload-name";

pub const DISCOVERY_RECORD_PREFIX: &str = "sessionplane-instance-";
pub const DISCOVERY_SCHEMA_VERSION: &str = "1";

// Discovery record data keys.
pub const RECORD_ID_KEY: &str = "id";
pub const RECORD_ANCHOR_KEY: &str = "anchor";
pub const RECORD_CLUSTER_UID_KEY: &str = "clusterUID";
pub const RECORD_SCHEMA_VERSION_KEY: &str = "schemaVersion";

// Provenance markers written by deployment tooling.
pub const ARGOCD_INSTANCE_KEY: &str = "argocd.argoproj.io/instance";
pub const ARGOCD_TRACKING_ID_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";
pub const HELM_RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";
pub const HELM_CHART_LABEL: &str = "helm.sh/chart";
pub const K8S_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const HELM_MANAGED_BY_VALUE: &str = "Helm";

pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";
