//! Read and write access to the metadata of managed resources.
//!
//! Adoption only rewrites labels and annotations, so the seam deals in
//! [`ObjectMeta`] rather than whole objects.

use crate::errors::LookupError;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[async_trait]
pub trait ManagedObjectStore: Send + Sync {
    async fn get_meta(&self, namespace: &str, name: &str) -> Result<ObjectMeta, LookupError>;

    /// Write back `meta.labels` and `meta.annotations` of the named object.
    ///
    /// # Errors
    /// [`LookupError::Conflict`] when `meta.resource_version` is set and the
    /// object has changed since it was read; [`LookupError::NotFound`] when
    /// it is gone.
    async fn update_meta(&self, meta: &ObjectMeta) -> Result<(), LookupError>;
}

/// Managed objects held in memory, keyed by namespace and name.
///
/// Every successful update bumps the resource version, so stale writes
/// conflict the same way they would against an API server.
#[derive(Default)]
pub struct InMemoryManagedObjects {
    objects: Mutex<BTreeMap<(String, String), ObjectMeta>>,
}

impl InMemoryManagedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut meta: ObjectMeta) {
        let key = key_of(&meta);
        meta.resource_version.get_or_insert_with(|| "1".to_string());
        self.lock().insert(key, meta);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ObjectMeta> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), ObjectMeta>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn key_of(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ManagedObjectStore for InMemoryManagedObjects {
    async fn get_meta(&self, namespace: &str, name: &str) -> Result<ObjectMeta, LookupError> {
        self.get(namespace, name).ok_or(LookupError::NotFound)
    }

    async fn update_meta(&self, meta: &ObjectMeta) -> Result<(), LookupError> {
        let mut objects = self.lock();
        let stored = objects.get_mut(&key_of(meta)).ok_or(LookupError::NotFound)?;
        if meta.resource_version.is_some() && meta.resource_version != stored.resource_version {
            return Err(LookupError::Conflict);
        }
        let version = stored
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        stored.labels = meta.labels.clone();
        stored.annotations = meta.annotations.clone();
        stored.resource_version = Some((version + 1).to_string());
        Ok(())
    }
}
