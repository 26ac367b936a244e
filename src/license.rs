//! License credential synchronization and key assignment.
//!
//! Licenses are optional: operators provision a canonical credential object
//! in the control namespace, and the provisioner copies it into each lab
//! namespace, keeping the copy in sync with the canonical source (never the
//! reverse). A device is then assigned the key matching its image version.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::ManagedDevice;
use crate::store::{CredentialObject, ObjectRef, Store, StoreError};
use crate::version::DeviceVersion;

/// Name of the credential object holding license keys, both the canonical
/// copy and the per-namespace copies.
pub const LICENSE_OBJECT_NAME: &str = "netdev-licenses";

/// Fixed namespace the controller itself runs in; the canonical license
/// credential object lives here.
pub const CONTROL_NAMESPACE: &str = "netsim-system";

/// Wildcard key matching every device version.
pub const WILDCARD_LICENSE_KEY: &str = "all.key";

#[derive(Debug, Error)]
pub enum LicenseError {
    /// A namespace copy exists but the canonical source is gone; the
    /// credential setup is misconfigured. Blocks licensing only, not
    /// workload creation.
    #[error("license provisioning failed: {0}")]
    ProvisioningFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Synchronizes license credential objects and assigns keys to devices.
pub struct LicenseProvisioner {
    store: Arc<dyn Store>,
}

impl LicenseProvisioner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        LicenseProvisioner { store }
    }

    /// Ensure `namespace` carries an up-to-date copy of the canonical
    /// license credential object.
    ///
    /// Returns `Ok(None)` when no canonical object was ever provisioned:
    /// licensing is optional and its absence is not an error.
    pub async fn ensure_credential(
        &self,
        namespace: &str,
    ) -> Result<Option<CredentialObject>, LicenseError> {
        let copy_ref = ObjectRef::new(namespace, LICENSE_OBJECT_NAME);
        let canonical_ref = ObjectRef::new(CONTROL_NAMESPACE, LICENSE_OBJECT_NAME);

        match self.store.get_credential(&copy_ref).await {
            Ok(existing) => self.sync_existing(existing, &canonical_ref).await,
            Err(err) if err.is_not_found() => self.copy_canonical(namespace, &canonical_ref).await,
            Err(err) => Err(err.into()),
        }
    }

    /// A copy exists: compare against the canonical source and overwrite on
    /// drift. A missing source at this point is a misconfiguration.
    async fn sync_existing(
        &self,
        existing: CredentialObject,
        canonical_ref: &ObjectRef,
    ) -> Result<Option<CredentialObject>, LicenseError> {
        let canonical = match self.store.get_credential(canonical_ref).await {
            Ok(canonical) => canonical,
            Err(err) if err.is_not_found() => {
                return Err(LicenseError::ProvisioningFailed(format!(
                    "canonical credential object {canonical_ref} is missing"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        if canonical.data == existing.data {
            debug!("license credential {} is in sync", existing.object_ref());
            return Ok(Some(existing));
        }

        info!(
            "license credential {} drifted, overwriting from {}",
            existing.object_ref(),
            canonical_ref
        );

        let updated = CredentialObject {
            data: canonical.data,
            ..existing
        };
        self.store.update_credential(&updated).await?;

        Ok(Some(updated))
    }

    /// No copy yet: create one from the canonical source, or skip licensing
    /// entirely when no source was provisioned.
    async fn copy_canonical(
        &self,
        namespace: &str,
        canonical_ref: &ObjectRef,
    ) -> Result<Option<CredentialObject>, LicenseError> {
        let canonical = match self.store.get_credential(canonical_ref).await {
            Ok(canonical) => canonical,
            Err(err) if err.is_not_found() => {
                debug!(
                    "no license credential provisioned in {}, skipping copy to {}",
                    CONTROL_NAMESPACE, namespace
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let copy = CredentialObject {
            name: LICENSE_OBJECT_NAME.to_string(),
            namespace: namespace.to_string(),
            data: canonical.data,
        };

        info!("copying license credential into {}", namespace);

        match self.store.create_credential(copy.clone()).await {
            Ok(()) => Ok(Some(copy)),
            // concurrent reconcile in the namespace created it first
            Err(err) if err.is_already_exists() => Ok(Some(copy)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Assign the license key matching the device's version.
///
/// An exact `{major}-{minor}.key` beats the wildcard `all.key`; with neither
/// present (or no credential at all) the key stays empty, which denotes an
/// unlicensed device. Engineering builds are skipped before any lookup.
pub fn assign_license_key(
    device: &mut ManagedDevice,
    credential: Option<&CredentialObject>,
    version: &DeviceVersion,
) {
    if version.is_engineering() {
        warn!(
            "device {} version could not be determined, continuing without a license",
            device.object_ref()
        );
        return;
    }

    let Some(credential) = credential else {
        return;
    };

    let exact = format!("{}-{}.key", version.major, version.minor);
    if credential.data.contains_key(&exact) {
        device.license_key = exact;
        return;
    }

    if credential.data.contains_key(WILDCARD_LICENSE_KEY) {
        device.license_key = WILDCARD_LICENSE_KEY.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::version::parse_version;

    fn credential(namespace: &str, keys: &[&str]) -> CredentialObject {
        CredentialObject {
            name: LICENSE_OBJECT_NAME.to_string(),
            namespace: namespace.to_string(),
            data: keys
                .iter()
                .map(|k| (k.to_string(), format!("license data for {k}")))
                .collect(),
        }
    }

    fn device() -> ManagedDevice {
        ManagedDevice {
            name: "r1".to_string(),
            namespace: "lab".to_string(),
            spec: Default::default(),
            status: Default::default(),
            license_key: String::new(),
        }
    }

    #[test]
    fn exact_key_beats_wildcard() {
        let mut d = device();
        let cred = credential("lab", &["21-6.key", WILDCARD_LICENSE_KEY]);
        assign_license_key(&mut d, Some(&cred), &parse_version("21.6.4").unwrap());
        assert_eq!(d.license_key, "21-6.key");
    }

    #[test]
    fn wildcard_used_when_no_exact_match() {
        let mut d = device();
        let cred = credential("lab", &["20-6.key", WILDCARD_LICENSE_KEY]);
        assign_license_key(&mut d, Some(&cred), &parse_version("21.6").unwrap());
        assert_eq!(d.license_key, WILDCARD_LICENSE_KEY);
    }

    #[test]
    fn no_matching_key_leaves_device_unlicensed() {
        let mut d = device();
        let cred = credential("lab", &["20-6.key"]);
        assign_license_key(&mut d, Some(&cred), &parse_version("21.6").unwrap());
        assert!(d.license_key.is_empty());
    }

    #[test]
    fn missing_credential_leaves_device_unlicensed() {
        let mut d = device();
        assign_license_key(&mut d, None, &parse_version("21.6").unwrap());
        assert!(d.license_key.is_empty());
    }

    #[test]
    fn engineering_build_skips_lookup() {
        let mut d = device();
        let cred = credential("lab", &[WILDCARD_LICENSE_KEY]);
        assign_license_key(&mut d, Some(&cred), &DeviceVersion::engineering());
        assert!(d.license_key.is_empty());
    }

    #[tokio::test]
    async fn ensure_copies_canonical_credential() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_credential(credential(CONTROL_NAMESPACE, &["21-6.key"]))
            .await;

        let provisioner = LicenseProvisioner::new(store.clone());
        let copy = provisioner.ensure_credential("lab").await.unwrap().unwrap();

        assert_eq!(copy.namespace, "lab");
        assert!(copy.data.contains_key("21-6.key"));
        assert!(store
            .get_credential(&ObjectRef::new("lab", LICENSE_OBJECT_NAME))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn ensure_without_canonical_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = LicenseProvisioner::new(store);

        assert!(provisioner.ensure_credential("lab").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_noop_when_copy_in_sync() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_credential(credential(CONTROL_NAMESPACE, &["21-6.key"]))
            .await;
        store.insert_credential(credential("lab", &["21-6.key"])).await;

        let provisioner = LicenseProvisioner::new(store.clone());
        let copy = provisioner.ensure_credential("lab").await.unwrap().unwrap();
        assert!(copy.data.contains_key("21-6.key"));
    }

    #[tokio::test]
    async fn ensure_overwrites_drifted_copy() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_credential(credential(CONTROL_NAMESPACE, &["22-3.key"]))
            .await;
        store.insert_credential(credential("lab", &["21-6.key"])).await;

        let provisioner = LicenseProvisioner::new(store.clone());
        let copy = provisioner.ensure_credential("lab").await.unwrap().unwrap();

        assert!(copy.data.contains_key("22-3.key"));
        let stored = store
            .get_credential(&ObjectRef::new("lab", LICENSE_OBJECT_NAME))
            .await
            .unwrap();
        assert_eq!(stored.data, copy.data);
        // canonical source is untouched
        let canonical = store
            .get_credential(&ObjectRef::new(CONTROL_NAMESPACE, LICENSE_OBJECT_NAME))
            .await
            .unwrap();
        assert!(canonical.data.contains_key("22-3.key"));
    }

    #[tokio::test]
    async fn ensure_fails_when_canonical_vanished() {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(credential("lab", &["21-6.key"])).await;

        let provisioner = LicenseProvisioner::new(store);
        let err = provisioner.ensure_credential("lab").await.unwrap_err();
        assert!(matches!(err, LicenseError::ProvisioningFailed(_)));
    }
}
