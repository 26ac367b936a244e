//! Bootstrap config objects every device workload mounts.
//!
//! Three namespace-scoped objects are ensured before the first workload
//! instance in a namespace is created: the variant templates, the topology
//! MAC assignment script and the workload entrypoint. Creation is idempotent
//! and independent of which device triggered it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::store::{ConfigObject, ObjectRef, Store, StoreError};

/// Per-model device variant templates.
pub const VARIANTS_OBJECT_NAME: &str = "netdev-variants";
/// Script wiring deterministic MAC addresses for topology links.
pub const TOPOMAC_OBJECT_NAME: &str = "netdev-topomac-script";
/// Entrypoint that stages the startup config and launches the device.
pub const ENTRYPOINT_OBJECT_NAME: &str = "netdev-entrypoint";

/// Data key for the topomac script inside its config object.
pub const TOPOMAC_SCRIPT_KEY: &str = "topomac.py";
/// Data key for the entrypoint script inside its config object.
pub const ENTRYPOINT_KEY: &str = "entrypoint.sh";

/// Read-only bootstrap asset table, injected at construction.
///
/// The built-in table is compiled into the binary; alternate tables can be
/// supplied for tests.
#[derive(Debug, Clone)]
pub struct BootstrapAssets {
    /// Variant templates keyed by model name.
    pub variants: HashMap<String, String>,
    pub topomac_script: String,
    pub entrypoint: String,
}

impl BootstrapAssets {
    /// The asset table compiled into the binary.
    pub fn builtin() -> Result<Self> {
        let variants: HashMap<String, String> =
            serde_json::from_str(include_str!("../assets/variants.json"))
                .context("parsing built-in variant templates")?;

        Ok(BootstrapAssets {
            variants,
            topomac_script: include_str!("../assets/topomac.py").to_string(),
            entrypoint: include_str!("../assets/entrypoint.sh").to_string(),
        })
    }
}

/// Idempotently ensures the bootstrap config objects exist per namespace.
pub struct ConfigObjectEnsurer {
    store: Arc<dyn Store>,
    assets: BootstrapAssets,
}

impl ConfigObjectEnsurer {
    pub fn new(store: Arc<dyn Store>, assets: BootstrapAssets) -> Self {
        ConfigObjectEnsurer { store, assets }
    }

    /// Ensure all three bootstrap objects exist in `namespace`.
    ///
    /// Safe to call on every reconcile pass; existing objects are left
    /// untouched.
    pub async fn ensure(&self, namespace: &str) -> Result<(), StoreError> {
        self.ensure_object(namespace, VARIANTS_OBJECT_NAME, self.variants_data())
            .await?;
        self.ensure_object(
            namespace,
            TOPOMAC_OBJECT_NAME,
            BTreeMap::from([(
                TOPOMAC_SCRIPT_KEY.to_string(),
                self.assets.topomac_script.clone(),
            )]),
        )
        .await?;
        self.ensure_object(
            namespace,
            ENTRYPOINT_OBJECT_NAME,
            BTreeMap::from([(ENTRYPOINT_KEY.to_string(), self.assets.entrypoint.clone())]),
        )
        .await
    }

    fn variants_data(&self) -> BTreeMap<String, String> {
        self.assets
            .variants
            .iter()
            .map(|(model, template)| (model.clone(), template.clone()))
            .collect()
    }

    async fn ensure_object(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let id = ObjectRef::new(namespace, name);

        match self.store.get_config_object(&id).await {
            Ok(_) => {
                debug!("config object {} already present", id);
                return Ok(());
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        info!("creating config object {}", id);

        match self
            .store
            .create_config_object(ConfigObject {
                name: name.to_string(),
                namespace: namespace.to_string(),
                data,
            })
            .await
        {
            Ok(()) => Ok(()),
            // another reconcile in the same namespace created it first
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
