//! Declarative-resource store abstraction.
//!
//! The engine consumes four verbs (get, create, update, status-update) over
//! the resource kinds it touches; the watch/dispatch mechanism that triggers
//! reconciliation lives outside this crate. `MemoryStore` backs tests and the
//! lab harness binary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::device::ManagedDevice;
use crate::instance::{InstanceStatus, WorkloadInstance};

/// Namespaced identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        ObjectRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors surfaced by store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectRef),
    #[error("{0} already exists")]
    AlreadyExists(ObjectRef),
    /// Optimistic-concurrency failure on a write; retried by the next
    /// dispatch, never inline.
    #[error("conflicting write to {0}")]
    Conflict(ObjectRef),
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// An idempotent bootstrap config object, created once per namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigObject {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

/// A keyed credential object holding license files.
///
/// The canonical copy lives in the control namespace and is read-only for
/// this crate; per-namespace copies are synchronized from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialObject {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

impl CredentialObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }
}

/// The declarative-resource backend, reduced to the verbs the engine needs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_device(&self, id: &ObjectRef) -> Result<ManagedDevice, StoreError>;
    /// Replace the device status with the given value as one atomic write.
    async fn update_device_status(&self, device: &ManagedDevice) -> Result<(), StoreError>;

    async fn get_instance(&self, id: &ObjectRef) -> Result<WorkloadInstance, StoreError>;
    async fn create_instance(&self, instance: WorkloadInstance) -> Result<(), StoreError>;

    async fn get_config_object(&self, id: &ObjectRef) -> Result<ConfigObject, StoreError>;
    async fn create_config_object(&self, object: ConfigObject) -> Result<(), StoreError>;

    async fn get_credential(&self, id: &ObjectRef) -> Result<CredentialObject, StoreError>;
    async fn create_credential(&self, credential: CredentialObject) -> Result<(), StoreError>;
    async fn update_credential(&self, credential: &CredentialObject) -> Result<(), StoreError>;
}

/// In-memory store used by tests and the lab harness.
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<ObjectRef, ManagedDevice>>,
    instances: RwLock<HashMap<ObjectRef, WorkloadInstance>>,
    config_objects: RwLock<HashMap<ObjectRef, ConfigObject>>,
    credentials: RwLock<HashMap<ObjectRef, CredentialObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a device, as the external topology layer would.
    pub async fn insert_device(&self, device: ManagedDevice) {
        self.devices
            .write()
            .await
            .insert(device.object_ref(), device);
    }

    /// Seed a credential object, as an operator provisioning licenses would.
    pub async fn insert_credential(&self, credential: CredentialObject) {
        self.credentials
            .write()
            .await
            .insert(credential.object_ref(), credential);
    }

    /// Refs of all stored instances, for the harness simulator.
    pub async fn instance_refs(&self) -> Vec<ObjectRef> {
        self.instances.read().await.keys().cloned().collect()
    }

    /// Overwrite an instance status, as the external runtime would.
    pub async fn set_instance_status(
        &self,
        id: &ObjectRef,
        status: InstanceStatus,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        instance.status = status;
        Ok(())
    }

    pub async fn config_object_count(&self, namespace: &str) -> usize {
        self.config_objects
            .read()
            .await
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_device(&self, id: &ObjectRef) -> Result<ManagedDevice, StoreError> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_device_status(&self, device: &ManagedDevice) -> Result<(), StoreError> {
        let id = device.object_ref();
        let mut devices = self.devices.write().await;
        let stored = devices
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        stored.status = device.status.clone();
        Ok(())
    }

    async fn get_instance(&self, id: &ObjectRef) -> Result<WorkloadInstance, StoreError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn create_instance(&self, instance: WorkloadInstance) -> Result<(), StoreError> {
        let id = ObjectRef::new(&instance.namespace, &instance.name);
        let mut instances = self.instances.write().await;
        if instances.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        instances.insert(id, instance);
        Ok(())
    }

    async fn get_config_object(&self, id: &ObjectRef) -> Result<ConfigObject, StoreError> {
        self.config_objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn create_config_object(&self, object: ConfigObject) -> Result<(), StoreError> {
        let id = ObjectRef::new(&object.namespace, &object.name);
        let mut objects = self.config_objects.write().await;
        if objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        objects.insert(id, object);
        Ok(())
    }

    async fn get_credential(&self, id: &ObjectRef) -> Result<CredentialObject, StoreError> {
        self.credentials
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn create_credential(&self, credential: CredentialObject) -> Result<(), StoreError> {
        let id = credential.object_ref();
        let mut credentials = self.credentials.write().await;
        if credentials.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        credentials.insert(id, credential);
        Ok(())
    }

    async fn update_credential(&self, credential: &CredentialObject) -> Result<(), StoreError> {
        let id = credential.object_ref();
        let mut credentials = self.credentials.write().await;
        let stored = credentials
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        stored.data = credential.data.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceStatus, LifecyclePhase};

    fn device(name: &str) -> ManagedDevice {
        ManagedDevice {
            name: name.to_string(),
            namespace: "lab".to_string(),
            spec: Default::default(),
            status: Default::default(),
            license_key: String::new(),
        }
    }

    #[tokio::test]
    async fn device_status_update_replaces_status_only() {
        let store = MemoryStore::new();
        store.insert_device(device("r1")).await;

        let mut updated = device("r1");
        updated.status = DeviceStatus {
            image: "img:1".to_string(),
            phase: LifecyclePhase::Running,
            ready: true,
            ..Default::default()
        };
        store.update_device_status(&updated).await.unwrap();

        let stored = store
            .get_device(&ObjectRef::new("lab", "r1"))
            .await
            .unwrap();
        assert_eq!(stored.status, updated.status);
    }

    #[tokio::test]
    async fn create_is_existence_checked() {
        let store = MemoryStore::new();
        let object = ConfigObject {
            name: "vars".to_string(),
            namespace: "lab".to_string(),
            data: BTreeMap::new(),
        };

        store.create_config_object(object.clone()).await.unwrap();
        let err = store.create_config_object(object).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn missing_objects_report_not_found() {
        let store = MemoryStore::new();
        let id = ObjectRef::new("lab", "ghost");

        assert!(store.get_device(&id).await.unwrap_err().is_not_found());
        assert!(store.get_instance(&id).await.unwrap_err().is_not_found());
        assert!(store.get_credential(&id).await.unwrap_err().is_not_found());
    }
}
