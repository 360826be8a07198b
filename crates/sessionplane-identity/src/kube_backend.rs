//! Kubernetes-backed [`OwnerLookup`], [`DiscoveryStore`] and
//! [`ManagedObjectStore`].

use crate::discovery::{DiscoveryRecord, DiscoveryStore, discovery_selector};
use crate::errors::{DiscoveryError, LookupError};
use crate::labels::{
    RECORD_ANCHOR_KEY, RECORD_CLUSTER_UID_KEY, RECORD_ID_KEY, RECORD_SCHEMA_VERSION_KEY,
};
use crate::objects::ManagedObjectStore;
use crate::walker::{ObjectSnapshot, OwnerLookup};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{GroupVersion, GroupVersionKind};
use kube::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

const CLUSTER_UID_NAMESPACE: &str = "kube-system";

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, kube::Error>>,
) -> Result<T, CallError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(kube::Error::Api(ae))) => Err(CallError::Status(ae.code, ae.message)),
        Ok(Err(err)) => Err(CallError::Other(err.to_string())),
        Err(_) => Err(CallError::Other("kubernetes call timed out".to_string())),
    }
}

enum CallError {
    Status(u16, String),
    Other(String),
}

impl From<CallError> for LookupError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Status(403, _) | CallError::Status(401, _) => LookupError::Forbidden,
            CallError::Status(404, _) => LookupError::NotFound,
            CallError::Status(409, _) => LookupError::Conflict,
            CallError::Status(code, message) => LookupError::Other(format!("{code}: {message}")),
            CallError::Other(message) => LookupError::Other(message),
        }
    }
}

fn discovery_error(err: CallError, name: &str) -> DiscoveryError {
    match err {
        CallError::Status(409, _) => DiscoveryError::AlreadyExists(name.to_string()),
        CallError::Status(403, message) | CallError::Status(401, message) => {
            DiscoveryError::Forbidden(message)
        }
        CallError::Status(code, message) => DiscoveryError::Unavailable(format!("{code}: {message}")),
        CallError::Other(message) => DiscoveryError::Unavailable(message),
    }
}

/// Reads pods and arbitrary owner kinds through the dynamic API.
#[derive(Clone)]
pub struct KubeOwnerLookup {
    client: Client,
    timeout: Duration,
}

impl KubeOwnerLookup {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<ObjectSnapshot, LookupError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = bounded(self.timeout, api.get(name)).await?;
        Ok(ObjectSnapshot::from_meta("Pod", "v1", &pod.metadata))
    }

    async fn get_owner(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<ObjectSnapshot, LookupError> {
        let gv: GroupVersion = owner
            .api_version
            .parse()
            .map_err(|err| LookupError::Other(format!("invalid apiVersion: {err}")))?;
        let resource = ApiResource::from_gvk(&gv.with_kind(&owner.kind));
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let object = bounded(self.timeout, api.get(&owner.name)).await?;
        Ok(ObjectSnapshot::from_meta(
            &owner.kind,
            &owner.api_version,
            &object.metadata,
        ))
    }
}

/// Discovery records stored as ConfigMaps.
#[derive(Clone)]
pub struct KubeDiscoveryStore {
    client: Client,
    timeout: Duration,
}

impl KubeDiscoveryStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

pub fn record_to_config_map(record: &DiscoveryRecord) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            namespace: Some(record.namespace.clone()),
            labels: Some(record.labels.clone()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            (RECORD_ID_KEY.to_string(), record.id.clone()),
            (RECORD_ANCHOR_KEY.to_string(), record.anchor.clone()),
            (RECORD_CLUSTER_UID_KEY.to_string(), record.cluster_uid.clone()),
            (
                RECORD_SCHEMA_VERSION_KEY.to_string(),
                record.schema_version.clone(),
            ),
        ])),
        ..ConfigMap::default()
    }
}

pub fn record_from_config_map(config_map: &ConfigMap) -> DiscoveryRecord {
    let data = config_map.data.clone().unwrap_or_default();
    let field = |key: &str| data.get(key).cloned().unwrap_or_default();
    DiscoveryRecord {
        name: config_map.metadata.name.clone().unwrap_or_default(),
        namespace: config_map.metadata.namespace.clone().unwrap_or_default(),
        id: field(RECORD_ID_KEY),
        anchor: field(RECORD_ANCHOR_KEY),
        cluster_uid: field(RECORD_CLUSTER_UID_KEY),
        schema_version: field(RECORD_SCHEMA_VERSION_KEY),
        labels: config_map.metadata.labels.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl DiscoveryStore for KubeDiscoveryStore {
    async fn cluster_uid(&self) -> Result<String, DiscoveryError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = bounded(self.timeout, api.get(CLUSTER_UID_NAMESPACE))
            .await
            .map_err(|err| discovery_error(err, CLUSTER_UID_NAMESPACE))?;
        Ok(namespace.metadata.uid.unwrap_or_default())
    }

    async fn get_record(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DiscoveryRecord>, DiscoveryError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match bounded(self.timeout, api.get(name)).await {
            Ok(config_map) => Ok(Some(record_from_config_map(&config_map))),
            Err(CallError::Status(404, _)) => Ok(None),
            Err(err) => Err(discovery_error(err, name)),
        }
    }

    async fn create_record(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &record.namespace);
        bounded(
            self.timeout,
            api.create(&PostParams::default(), &record_to_config_map(record)),
        )
        .await
        .map_err(|err| discovery_error(err, &record.name))?;
        Ok(())
    }

    async fn list_records(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
        let api: Api<ConfigMap> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(&discovery_selector());
        let list = bounded(self.timeout, api.list(&params))
            .await
            .map_err(|err| discovery_error(err, "configmaps"))?;
        Ok(list.items.iter().map(record_from_config_map).collect())
    }
}

/// Managed resources of one configured kind, read and patched through the
/// dynamic API.
#[derive(Clone)]
pub struct KubeManagedObjects {
    client: Client,
    timeout: Duration,
    resource: ApiResource,
}

impl KubeManagedObjects {
    pub fn new(client: Client, timeout: Duration, gvk: &GroupVersionKind) -> Self {
        Self {
            client,
            timeout,
            resource: ApiResource::from_gvk(gvk),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

/// Merge patch body touching only labels and annotations. Carrying the
/// resource version makes the API server reject the write if the object moved.
#[derive(Debug, Serialize)]
struct MetadataPatch<'a> {
    metadata: MetadataFields<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFields<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<&'a str>,
}

fn metadata_patch(meta: &ObjectMeta) -> MetadataPatch<'_> {
    MetadataPatch {
        metadata: MetadataFields {
            labels: meta.labels.as_ref(),
            annotations: meta.annotations.as_ref(),
            resource_version: meta.resource_version.as_deref(),
        },
    }
}

#[async_trait]
impl ManagedObjectStore for KubeManagedObjects {
    async fn get_meta(&self, namespace: &str, name: &str) -> Result<ObjectMeta, LookupError> {
        let object = bounded(self.timeout, self.api(namespace).get(name)).await?;
        Ok(object.metadata)
    }

    async fn update_meta(&self, meta: &ObjectMeta) -> Result<(), LookupError> {
        let (Some(namespace), Some(name)) = (meta.namespace.as_deref(), meta.name.as_deref()) else {
            return Err(LookupError::Other("object has no namespace or name".to_string()));
        };
        let patch = metadata_patch(meta);
        bounded(
            self.timeout,
            self.api(namespace)
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{Anchor, AnchorKind};

    #[test]
    fn config_map_round_trips_record_fields() {
        let anchor = Anchor::new(AnchorKind::ArgoApplication, "ops", "sessions-prod");
        let record = DiscoveryRecord::new("ops", &anchor, "i1-abc", "uid-1");
        let config_map = record_to_config_map(&record);
        assert_eq!(config_map.metadata.name.as_deref(), Some(record.name.as_str()));
        let data = config_map.data.as_ref().expect("data");
        assert_eq!(data[RECORD_ANCHOR_KEY], "argocd-app:ops:sessions-prod");
        assert_eq!(data[RECORD_SCHEMA_VERSION_KEY], "1");
        assert_eq!(record_from_config_map(&config_map), record);
    }

    #[test]
    fn status_codes_map_to_lookup_errors() {
        assert_eq!(
            LookupError::from(CallError::Status(403, String::new())),
            LookupError::Forbidden
        );
        assert_eq!(
            LookupError::from(CallError::Status(404, String::new())),
            LookupError::NotFound
        );
        assert!(matches!(
            LookupError::from(CallError::Status(500, "boom".into())),
            LookupError::Other(_)
        ));
        assert_eq!(
            LookupError::from(CallError::Status(409, String::new())),
            LookupError::Conflict
        );
        assert!(matches!(
            discovery_error(CallError::Status(409, String::new()), "x"),
            DiscoveryError::AlreadyExists(_)
        ));
    }

    #[test]
    fn metadata_patch_carries_only_labels_annotations_and_version() {
        let meta = ObjectMeta {
            name: Some("session-1".to_string()),
            namespace: Some("team-a".to_string()),
            labels: Some(BTreeMap::from([("a".to_string(), "1".to_string())])),
            resource_version: Some("42".to_string()),
            ..ObjectMeta::default()
        };
        let rendered = serde_json::to_value(metadata_patch(&meta)).expect("render");
        let metadata = &rendered["metadata"];
        assert_eq!(metadata["labels"]["a"], "1");
        assert_eq!(metadata["resourceVersion"], "42");
        assert!(metadata.get("annotations").is_none());
        assert!(metadata.get("name").is_none());
    }
}
