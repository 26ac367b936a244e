//! Launch specification materialization.
//!
//! Turns a `ManagedDevice` into the launch specification of its workload
//! instance. This is a deterministic data transform; the engine consumes the
//! result only via `Store::create_instance`.

use crate::bootstrap::{
    ENTRYPOINT_KEY, ENTRYPOINT_OBJECT_NAME, TOPOMAC_OBJECT_NAME, VARIANTS_OBJECT_NAME,
};
use crate::device::ManagedDevice;
use crate::instance::{InitSpec, InstanceSpec, Mount, Volume, VolumeSource};
use crate::license::LICENSE_OBJECT_NAME;
use crate::version::resolve_image;

/// Image of the init container that waits for topology wiring.
const INIT_WAIT_IMAGE: &str = "ghcr.io/netsim/init-wait:latest";

/// Environment marker every device workload expects.
const DEVICE_ENV_MARKER: (&str, &str) = ("NETDEV", "1");

const VARIANTS_VOLUME: &str = "variants";
const VARIANTS_MOUNT_PATH: &str = "/tmp/topo";
/// File name the variant template is projected as.
const VARIANTS_TEMPLATE_NAME: &str = "topo-template.yml";

const TOPOMAC_VOLUME: &str = "topomac-script";
const TOPOMAC_MOUNT_PATH: &str = "/tmp/topomac";

const ENTRYPOINT_VOLUME: &str = "entrypoint";
const ENTRYPOINT_MOUNT_PATH: &str = "/entrypoint.sh";

const LICENSE_VOLUME: &str = "license";
const LICENSE_FILE_NAME: &str = "license.key";
const LICENSE_MOUNT_PATH: &str = "/opt/netdev/etc/license.key";

const STARTUP_CONFIG_VOLUME: &str = "startup-config-volume";
/// Default directory the startup config file is mounted under.
pub const DEFAULT_CONFIG_PATH: &str = "/tmp/startup-config";

/// Builds the launch specification for a device's workload instance.
pub trait Materializer: Send + Sync {
    fn build_instance_spec(&self, device: &ManagedDevice) -> InstanceSpec;
}

/// The standard materialization used by the controller.
#[derive(Debug, Default)]
pub struct DefaultMaterializer;

impl Materializer for DefaultMaterializer {
    fn build_instance_spec(&self, device: &ManagedDevice) -> InstanceSpec {
        let cfg = device.spec.config();

        let mut env = cfg.env.clone();
        env.insert(
            DEVICE_ENV_MARKER.0.to_string(),
            DEVICE_ENV_MARKER.1.to_string(),
        );

        let mut volumes = vec![
            Volume {
                name: VARIANTS_VOLUME.to_string(),
                source: VolumeSource::ConfigObject {
                    name: VARIANTS_OBJECT_NAME.to_string(),
                    item: Some(device.spec.model().to_string()),
                },
            },
            Volume {
                name: TOPOMAC_VOLUME.to_string(),
                source: VolumeSource::ConfigObject {
                    name: TOPOMAC_OBJECT_NAME.to_string(),
                    item: None,
                },
            },
            Volume {
                name: ENTRYPOINT_VOLUME.to_string(),
                source: VolumeSource::ConfigObject {
                    name: ENTRYPOINT_OBJECT_NAME.to_string(),
                    item: Some(ENTRYPOINT_KEY.to_string()),
                },
            },
        ];

        let mut mounts = vec![
            Mount {
                volume: VARIANTS_VOLUME.to_string(),
                path: VARIANTS_MOUNT_PATH.to_string(),
                sub_path: None,
                read_only: false,
            },
            Mount {
                volume: TOPOMAC_VOLUME.to_string(),
                path: TOPOMAC_MOUNT_PATH.to_string(),
                sub_path: None,
                read_only: false,
            },
            Mount {
                volume: ENTRYPOINT_VOLUME.to_string(),
                path: ENTRYPOINT_MOUNT_PATH.to_string(),
                sub_path: Some(ENTRYPOINT_KEY.to_string()),
                read_only: false,
            },
        ];

        if !device.license_key.is_empty() {
            volumes.push(Volume {
                name: LICENSE_VOLUME.to_string(),
                source: VolumeSource::Credential {
                    name: LICENSE_OBJECT_NAME.to_string(),
                    key: device.license_key.clone(),
                },
            });
            mounts.push(Mount {
                volume: LICENSE_VOLUME.to_string(),
                path: LICENSE_MOUNT_PATH.to_string(),
                sub_path: Some(LICENSE_FILE_NAME.to_string()),
                read_only: true,
            });
        }

        if cfg.config_data_present {
            let config_path = if cfg.config_path.is_empty() {
                DEFAULT_CONFIG_PATH
            } else {
                cfg.config_path.as_str()
            };

            // the topology layer creates a "<device>-config" object holding
            // the declared startup config payload
            volumes.push(Volume {
                name: STARTUP_CONFIG_VOLUME.to_string(),
                source: VolumeSource::ConfigObject {
                    name: format!("{}-config", device.name),
                    item: None,
                },
            });
            mounts.push(Mount {
                volume: STARTUP_CONFIG_VOLUME.to_string(),
                path: format!("{}/{}", config_path, cfg.config_file),
                sub_path: Some(cfg.config_file.clone()),
                read_only: true,
            });
        }

        InstanceSpec {
            image: resolve_image(&device.spec),
            command: cfg.command(),
            args: cfg.args(),
            env,
            init: InitSpec {
                image: INIT_WAIT_IMAGE.to_string(),
                // one extra interface for the management plane
                wait_for_interfaces: device.spec.num_interfaces + 1,
                sleep: cfg.sleep,
            },
            constraints: device.spec.constraints(),
            volumes,
            mounts,
        }
    }
}
