use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Kubernetes label values are limited to 63 characters.
pub const MAX_LABEL_VALUE_LEN: usize = 63;
const HASH_SUFFIX_LEN: usize = 10;
const UNRESOLVED_NAME: &str = "owner-unresolved";

/// Deployment mechanism that owns an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AnchorKind {
    ArgoApplication,
    HelmRelease,
    Deployment,
    StatefulSet,
    DaemonSet,
    CronJob,
    Job,
    ReplicationController,
    Pod,
    Unresolved,
}

impl AnchorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnchorKind::ArgoApplication => "argocd-app",
            AnchorKind::HelmRelease => "helm-release",
            AnchorKind::Deployment => "deployment",
            AnchorKind::StatefulSet => "statefulset",
            AnchorKind::DaemonSet => "daemonset",
            AnchorKind::CronJob => "cronjob",
            AnchorKind::Job => "job",
            AnchorKind::ReplicationController => "replicationcontroller",
            AnchorKind::Pod => "pod",
            AnchorKind::Unresolved => "unresolved",
        }
    }

    /// Map a Kubernetes controller kind to an anchor kind.
    ///
    /// Only workload kinds with stable names qualify; a bare ReplicaSet does
    /// not, since its name changes on every rollout.
    pub fn from_controller_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(AnchorKind::Deployment),
            "StatefulSet" => Some(AnchorKind::StatefulSet),
            "DaemonSet" => Some(AnchorKind::DaemonSet),
            "CronJob" => Some(AnchorKind::CronJob),
            "Job" => Some(AnchorKind::Job),
            "ReplicationController" => Some(AnchorKind::ReplicationController),
            _ => None,
        }
    }

    /// Kubernetes `(kind, apiVersion)` of a workload anchor kind.
    pub fn workload_resource(self) -> Option<(&'static str, &'static str)> {
        match self {
            AnchorKind::Deployment => Some(("Deployment", "apps/v1")),
            AnchorKind::StatefulSet => Some(("StatefulSet", "apps/v1")),
            AnchorKind::DaemonSet => Some(("DaemonSet", "apps/v1")),
            AnchorKind::CronJob => Some(("CronJob", "batch/v1")),
            AnchorKind::Job => Some(("Job", "batch/v1")),
            AnchorKind::ReplicationController => Some(("ReplicationController", "v1")),
            _ => None,
        }
    }

    /// Anchored on a deployment tool (GitOps application or package release)
    /// rather than on a Kubernetes object.
    pub fn is_provenance(self) -> bool {
        matches!(self, AnchorKind::ArgoApplication | AnchorKind::HelmRelease)
    }
}

impl fmt::Display for AnchorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "argocd-app" => Ok(AnchorKind::ArgoApplication),
            "helm-release" => Ok(AnchorKind::HelmRelease),
            "deployment" => Ok(AnchorKind::Deployment),
            "statefulset" => Ok(AnchorKind::StatefulSet),
            "daemonset" => Ok(AnchorKind::DaemonSet),
            "cronjob" => Ok(AnchorKind::CronJob),
            "job" => Ok(AnchorKind::Job),
            "replicationcontroller" => Ok(AnchorKind::ReplicationController),
            "pod" => Ok(AnchorKind::Pod),
            "unresolved" => Ok(AnchorKind::Unresolved),
            other => Err(format!("unknown anchor kind: {other}")),
        }
    }
}

impl From<AnchorKind> for String {
    fn from(kind: AnchorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for AnchorKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The `(kind, namespace, name)` triple describing how an installation is
/// deployed.
///
/// Constructed through [`Anchor::new`], which sanitizes `name` into a valid
/// label value. Rendered as `kind:namespace:name`; that rendering feeds the
/// instance ID hash and the discovery record name, so it must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    kind: AnchorKind,
    namespace: String,
    name: String,
}

impl Anchor {
    pub fn new(kind: AnchorKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: sanitize_label_value(name),
        }
    }

    pub fn unresolved(namespace: &str) -> Self {
        Self::new(AnchorKind::Unresolved, namespace, UNRESOLVED_NAME)
    }

    pub fn kind(&self) -> AnchorKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unresolved(&self) -> bool {
        self.kind == AnchorKind::Unresolved
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for Anchor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(3, ':');
        let kind = parts
            .next()
            .ok_or_else(|| "missing anchor kind".to_string())?;
        let namespace = parts
            .next()
            .ok_or_else(|| "missing anchor namespace".to_string())?;
        let name = parts
            .next()
            .ok_or_else(|| "missing anchor name".to_string())?;
        if namespace.is_empty() || name.is_empty() {
            return Err("empty anchor segment".to_string());
        }
        Ok(Anchor::new(kind.parse()?, namespace, name))
    }
}

/// Sanitize an arbitrary string into a Kubernetes label value.
///
/// Disallowed characters become `-`, leading/trailing separators are trimmed,
/// and values longer than 63 characters are truncated with a hash of the full
/// input appended so distinct long inputs stay distinct.
pub fn sanitize_label_value(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = trim_separators(&replaced);
    if trimmed.is_empty() {
        if raw.is_empty() {
            return "unknown".to_string();
        }
        return short_hash(raw);
    }
    if trimmed.len() <= MAX_LABEL_VALUE_LEN {
        return trimmed.to_string();
    }

    // Only ASCII remains after replacement, so byte slicing is char-safe.
    let keep = MAX_LABEL_VALUE_LEN - HASH_SUFFIX_LEN - 1;
    let prefix = trim_separators(&trimmed[..keep]);
    let hash = short_hash(raw);
    if prefix.is_empty() {
        hash
    } else {
        format!("{prefix}-{hash}")
    }
}

fn trim_separators(value: &str) -> &str {
    value.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)[..HASH_SUFFIX_LEN].to_string()
}
