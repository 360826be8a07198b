use crate::anchor::Anchor;
use crate::discovery::{DiscoveryRecord, DiscoveryStore, discovery_record_name};
use crate::errors::{DiscoveryError, LookupError};
use crate::resolver::{AnchorResolver, Resolution};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const INSTANCE_ID_PREFIX: &str = "i1-";
const INSTANCE_ID_BYTES: usize = 20;
const UNKNOWN_CLUSTER: &str = "unknown-cluster";

/// `i1-` + hex of the first 20 bytes of `sha256("<cluster_uid>|<anchor>")`.
pub fn derive_instance_id(cluster_uid: &str, anchor: &Anchor) -> String {
    let digest = Sha256::digest(format!("{cluster_uid}|{anchor}").as_bytes());
    format!(
        "{INSTANCE_ID_PREFIX}{}",
        hex::encode(&digest[..INSTANCE_ID_BYTES])
    )
}

/// How the running identity was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySource {
    /// Read from this anchor's discovery record.
    Existing,
    /// Reused from a record this installation wrote under an earlier anchor.
    LegacyMatch,
    Created,
    /// Another replica created the record first.
    RaceWinner,
    /// Persistence failed; identity lives only in this process.
    InMemory,
}

impl IdentitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentitySource::Existing => "existing",
            IdentitySource::LegacyMatch => "legacy-match",
            IdentitySource::Created => "created",
            IdentitySource::RaceWinner => "race-winner",
            IdentitySource::InMemory => "in-memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceIdentity {
    pub id: String,
    pub anchor: Anchor,
    pub namespace: String,
    pub cluster_uid: String,
    pub record_name: String,
    pub persisted: bool,
    pub source: IdentitySource,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl InstanceIdentity {
    /// Process-local identity that was never persisted.
    pub fn in_memory(namespace: &str, anchor: Anchor, cluster_uid: &str) -> Self {
        Self {
            id: derive_instance_id(cluster_uid, &anchor),
            record_name: discovery_record_name(&anchor),
            anchor,
            namespace: namespace.to_string(),
            cluster_uid: cluster_uid.to_string(),
            persisted: false,
            source: IdentitySource::InMemory,
            warnings: Vec::new(),
        }
    }
}

/// Resolves and persists this installation's identity exactly once.
pub struct InstanceIdentityService {
    resolver: AnchorResolver,
    store: Arc<dyn DiscoveryStore>,
    timeout: Duration,
    cell: OnceCell<InstanceIdentity>,
}

impl InstanceIdentityService {
    pub fn new(resolver: AnchorResolver, store: Arc<dyn DiscoveryStore>, timeout: Duration) -> Self {
        Self {
            resolver,
            store,
            timeout,
            cell: OnceCell::new(),
        }
    }

    /// This installation's identity, resolved on first use.
    ///
    /// # What it does
    /// Walks the own pod to an anchor, reads the cluster UID and derives the
    /// instance ID. An existing discovery record's ID wins over the derived
    /// one; otherwise a record left by this installation under an earlier
    /// anchor is reused, and only then is a new record created.
    ///
    /// # Invariants
    /// - Concurrent callers share a single resolution; later calls make no
    ///   cluster requests.
    /// - Never fails. Timeouts and store errors degrade to an unpersisted
    ///   identity whose `warnings` say why.
    pub async fn ensure(&self) -> &InstanceIdentity {
        self.cell.get_or_init(|| self.discover()).await
    }

    pub fn get(&self) -> Option<&InstanceIdentity> {
        self.cell.get()
    }

    async fn discover(&self) -> InstanceIdentity {
        let namespace = self.resolver.namespace().to_string();
        let mut warnings = Vec::new();

        let Resolution { anchor, workload } =
            match tokio::time::timeout(self.timeout, self.resolver.resolve()).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "anchor detection timed out");
                    warnings.push("anchor detection timed out".to_string());
                    Resolution {
                        anchor: Anchor::unresolved(&namespace),
                        workload: None,
                    }
                }
            };

        let cluster_uid = match self.bounded(self.store.cluster_uid()).await {
            Ok(uid) if !uid.is_empty() => uid,
            Ok(_) => {
                warnings.push("cluster uid empty".to_string());
                UNKNOWN_CLUSTER.to_string()
            }
            Err(err) => {
                tracing::warn!(error = %err, "cluster uid unavailable");
                warnings.push(format!("cluster uid unavailable: {err}"));
                UNKNOWN_CLUSTER.to_string()
            }
        };

        let mut identity = InstanceIdentity::in_memory(&namespace, anchor, &cluster_uid);
        match self.persist(&identity, workload.as_ref()).await {
            Ok((id, source)) => {
                identity.id = id;
                identity.source = source;
                identity.persisted = true;
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    instance_id = %identity.id,
                    "discovery record not persisted; tenant isolation is not guaranteed"
                );
                warnings.push(format!("discovery record not persisted: {err}"));
            }
        }
        identity.warnings = warnings;

        metrics::counter!(
            "sessionplane_identity_resolutions_total",
            "source" => identity.source.as_str()
        )
        .increment(1);
        tracing::info!(
            instance_id = %identity.id,
            anchor = %identity.anchor,
            source = identity.source.as_str(),
            persisted = identity.persisted,
            "instance identity established"
        );
        identity
    }

    async fn persist(
        &self,
        identity: &InstanceIdentity,
        workload: Option<&Anchor>,
    ) -> Result<(String, IdentitySource), DiscoveryError> {
        let namespace = identity.namespace.as_str();
        let existing = self
            .bounded(self.store.get_record(namespace, &identity.record_name))
            .await?;
        if let Some(record) = existing {
            if record.id.is_empty() {
                tracing::warn!(record = %record.name, "discovery record has no id; using computed id");
                return Ok((identity.id.clone(), IdentitySource::Existing));
            }
            return Ok((record.id, IdentitySource::Existing));
        }

        match self.legacy_match(identity, workload).await {
            Ok(Some(legacy)) => {
                tracing::info!(
                    legacy_record = %legacy.name,
                    legacy_anchor = %legacy.anchor,
                    "reusing instance id from legacy discovery record"
                );
                let record = DiscoveryRecord::new(
                    namespace,
                    &identity.anchor,
                    &legacy.id,
                    &identity.cluster_uid,
                );
                match self.bounded(self.store.create_record(&record)).await {
                    Ok(()) | Err(DiscoveryError::AlreadyExists(_)) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "unable to record migrated anchor")
                    }
                }
                return Ok((legacy.id, IdentitySource::LegacyMatch));
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "legacy discovery scan failed"),
        }

        let record = DiscoveryRecord::new(
            namespace,
            &identity.anchor,
            &identity.id,
            &identity.cluster_uid,
        );
        match self.bounded(self.store.create_record(&record)).await {
            Ok(()) => Ok((identity.id.clone(), IdentitySource::Created)),
            Err(DiscoveryError::AlreadyExists(_)) => {
                let winner = self
                    .bounded(self.store.get_record(namespace, &identity.record_name))
                    .await?
                    .filter(|record| !record.id.is_empty())
                    .ok_or_else(|| {
                        DiscoveryError::Unavailable("discovery record vanished after conflict".into())
                    })?;
                Ok((winner.id, IdentitySource::RaceWinner))
            }
            Err(err) => Err(err),
        }
    }

    /// A record this installation wrote before its anchor changed.
    ///
    /// Candidates share the cluster UID and anchor namespace/name, and sit on
    /// an upgrade path: the same kind under an older record name, or a
    /// workload anchor superseded by a provenance anchor. The object the old
    /// record was anchored on must be this installation's own workload or no
    /// longer exist; a live object of some other installation keeps its ID.
    async fn legacy_match(
        &self,
        identity: &InstanceIdentity,
        workload: Option<&Anchor>,
    ) -> Result<Option<DiscoveryRecord>, DiscoveryError> {
        let records = self
            .bounded(self.store.list_records(Some(&identity.namespace)))
            .await?;
        for record in records {
            if record.name == identity.record_name
                || record.id.is_empty()
                || record.cluster_uid != identity.cluster_uid
            {
                continue;
            }
            let Some(previous) = record.parsed_anchor() else {
                continue;
            };
            if previous.namespace() != identity.anchor.namespace()
                || previous.name() != identity.anchor.name()
                || !upgrade_path(&previous, &identity.anchor)
            {
                continue;
            }
            if self.same_or_gone(&previous, &identity.anchor, workload).await {
                return Ok(Some(record));
            }
            tracing::info!(
                record = %record.name,
                anchor = %previous,
                "discovery record belongs to another live workload; not reusing its id"
            );
        }
        Ok(None)
    }

    async fn same_or_gone(&self, previous: &Anchor, current: &Anchor, workload: Option<&Anchor>) -> bool {
        if previous == current || workload == Some(previous) {
            return true;
        }
        let Some((kind, api_version)) = previous.kind().workload_resource() else {
            return false;
        };
        let reference = OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: previous.name().to_string(),
            ..OwnerReference::default()
        };
        let lookup = self.resolver.lookup().get_owner(previous.namespace(), &reference);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Err(LookupError::NotFound)) => true,
            Ok(Ok(_)) => false,
            Ok(Err(err)) => {
                tracing::warn!(anchor = %previous, error = %err, "cannot confirm previous anchor is gone");
                false
            }
            Err(_) => false,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DiscoveryError>>,
    ) -> Result<T, DiscoveryError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| DiscoveryError::Unavailable("kubernetes call timed out".to_string()))?
    }
}

fn upgrade_path(previous: &Anchor, current: &Anchor) -> bool {
    previous.kind() == current.kind()
        || (previous.kind().workload_resource().is_some() && current.kind().is_provenance())
}
