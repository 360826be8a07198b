use crate::anchor::{Anchor, AnchorKind};
use crate::detector::DiscoveryMethod;
use crate::errors::DiscoveryError;
use crate::labels::{
    ARGOCD_APP_LABEL, COMPONENT_LABEL, COMPONENT_SERVER, DISCOVERY_METHOD_LABEL,
    DISCOVERY_RECORD_PREFIX, DISCOVERY_SCHEMA_VERSION, HELM_RELEASE_LABEL, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, PART_OF_LABEL, PART_OF_VALUE, WORKLOAD_NAME_LABEL,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Persisted `(id, anchor)` of one installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub name: String,
    pub namespace: String,
    pub id: String,
    pub anchor: String,
    pub cluster_uid: String,
    pub schema_version: String,
    pub labels: BTreeMap<String, String>,
}

impl DiscoveryRecord {
    pub fn new(namespace: &str, anchor: &Anchor, id: &str, cluster_uid: &str) -> Self {
        let method = DiscoveryMethod::for_anchor(anchor.kind());
        let mut labels = BTreeMap::from([
            (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (COMPONENT_LABEL.to_string(), COMPONENT_SERVER.to_string()),
            (DISCOVERY_METHOD_LABEL.to_string(), method.to_string()),
        ]);
        let provenance_label = match anchor.kind() {
            AnchorKind::ArgoApplication => ARGOCD_APP_LABEL,
            AnchorKind::HelmRelease => HELM_RELEASE_LABEL,
            _ => WORKLOAD_NAME_LABEL,
        };
        labels.insert(provenance_label.to_string(), anchor.name().to_string());

        Self {
            name: discovery_record_name(anchor),
            namespace: namespace.to_string(),
            id: id.to_string(),
            anchor: anchor.to_string(),
            cluster_uid: cluster_uid.to_string(),
            schema_version: DISCOVERY_SCHEMA_VERSION.to_string(),
            labels,
        }
    }

    pub fn parsed_anchor(&self) -> Option<Anchor> {
        self.anchor.parse().ok()
    }
}

/// `sessionplane-instance-<10 hex of sha256(anchor)>`.
pub fn discovery_record_name(anchor: &Anchor) -> String {
    let digest = Sha256::digest(anchor.to_string().as_bytes());
    format!("{DISCOVERY_RECORD_PREFIX}{}", &hex::encode(digest)[..10])
}

/// Label selector matching every installation's discovery record.
pub fn discovery_selector() -> String {
    format!("{PART_OF_LABEL}={PART_OF_VALUE},{COMPONENT_LABEL}={COMPONENT_SERVER}")
}

/// Where discovery records live.
///
/// # Errors
/// Every method reports [`DiscoveryError::Forbidden`] when the service
/// account lacks access and [`DiscoveryError::Unavailable`] for anything
/// else the backend could not do. Callers treat both as a reason to degrade,
/// never to fail startup.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    /// UID of the `kube-system` namespace, used as the cluster's identity.
    async fn cluster_uid(&self) -> Result<String, DiscoveryError>;

    async fn get_record(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DiscoveryRecord>, DiscoveryError>;

    /// Fails with [`DiscoveryError::AlreadyExists`] when the name is taken.
    async fn create_record(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError>;

    /// `None` lists across all namespaces.
    async fn list_records(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<DiscoveryRecord>, DiscoveryError>;
}

pub struct InMemoryDiscoveryStore {
    cluster_uid: Option<String>,
    records: Mutex<HashMap<(String, String), DiscoveryRecord>>,
    creates: AtomicUsize,
    available: AtomicBool,
    cluster_list_allowed: AtomicBool,
}

impl InMemoryDiscoveryStore {
    pub fn new(cluster_uid: &str) -> Self {
        Self {
            cluster_uid: Some(cluster_uid.to_string()),
            records: Mutex::new(HashMap::new()),
            creates: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            cluster_list_allowed: AtomicBool::new(true),
        }
    }

    /// A store whose cluster UID cannot be read.
    pub fn without_cluster_uid() -> Self {
        Self {
            cluster_uid: None,
            ..Self::new("")
        }
    }

    pub fn insert(&self, record: DiscoveryRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert((record.namespace.clone(), record.name.clone()), record);
        }
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_cluster_list_allowed(&self, allowed: bool) {
        self.cluster_list_allowed.store(allowed, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DiscoveryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DiscoveryError::Unavailable("store offline".to_string()))
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), DiscoveryRecord>>, DiscoveryError>
    {
        self.records
            .lock()
            .map_err(|_| DiscoveryError::Unavailable("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DiscoveryStore for InMemoryDiscoveryStore {
    async fn cluster_uid(&self) -> Result<String, DiscoveryError> {
        self.cluster_uid
            .clone()
            .ok_or_else(|| DiscoveryError::Forbidden("namespaces".to_string()))
    }

    async fn get_record(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DiscoveryRecord>, DiscoveryError> {
        self.check_available()?;
        Ok(self
            .lock()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_record(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError> {
        self.check_available()?;
        let mut records = self.lock()?;
        let key = (record.namespace.clone(), record.name.clone());
        if records.contains_key(&key) {
            return Err(DiscoveryError::AlreadyExists(record.name.clone()));
        }
        records.insert(key, record.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_records(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
        self.check_available()?;
        if namespace.is_none() && !self.cluster_list_allowed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Forbidden("cluster-scope configmaps".to_string()));
        }
        let mut records: Vec<DiscoveryRecord> = self
            .lock()?
            .values()
            .filter(|record| namespace.map_or(true, |ns| record.namespace == ns))
            .cloned()
            .collect();
        records.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(records)
    }
}
