//! Declarative device resource types.
//!
//! A `ManagedDevice` describes the desired state of one simulated network
//! device. The reconciliation engine converges it with a workload instance
//! and reports progress through `DeviceStatus`, the only externally visible
//! output of the control loop.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::ObjectRef;

/// Default device model (variant) used when the spec leaves it empty.
pub const DEFAULT_MODEL: &str = "ixr-d2l";

/// Default command for the device container.
const DEFAULT_COMMAND: &[&str] = &["/tini", "--", "/entrypoint.sh"];

/// Default arguments for the device container.
const DEFAULT_ARGS: &[&str] = &["sudo", "bash", "-c", "/opt/netdev/bin/device"];

fn default_constraints() -> HashMap<String, String> {
    HashMap::from([
        ("cpu".to_string(), "500Mi".to_string()),
        ("memory".to_string(), "2Gi".to_string()),
    ])
}

/// Desired state of a managed device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSpec {
    /// Optional node configuration block.
    pub config: Option<DeviceConfig>,
    /// Number of data-plane interfaces the device exposes.
    pub num_interfaces: u32,
    /// Resource constraints for the workload instance.
    pub constraints: Option<HashMap<String, String>>,
    /// Device model (variant), e.g. a chassis type.
    pub model: String,
    /// Explicit version, for cases where it is not encoded in the image tag.
    pub version: String,
}

impl DeviceSpec {
    /// Config block, or built-in defaults when none was declared.
    pub fn config(&self) -> DeviceConfig {
        self.config.clone().unwrap_or_default()
    }

    /// Resource constraints, or built-in defaults when none were declared.
    pub fn constraints(&self) -> HashMap<String, String> {
        self.constraints.clone().unwrap_or_else(default_constraints)
    }

    /// Device model, or the default variant when none was declared.
    pub fn model(&self) -> &str {
        if self.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &self.model
        }
    }
}

/// Node configuration parameters carried inside a device spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Command to run in the workload instance.
    pub command: Option<Vec<String>>,
    /// Arguments for the command.
    pub args: Option<Vec<String>>,
    /// Container image; takes precedence over the version-derived image.
    pub image: String,
    /// Environment variables passed to the workload instance.
    pub env: HashMap<String, String>,
    /// Directory inside the instance that holds the startup config file.
    pub config_path: String,
    /// Startup configuration file name.
    pub config_file: String,
    /// True when a startup config payload was declared for this device.
    pub config_data_present: bool,
    /// Seconds the init container sleeps before starting the device.
    pub sleep: u32,
}

impl DeviceConfig {
    /// Declared command, or the built-in default.
    pub fn command(&self) -> Vec<String> {
        match &self.command {
            Some(cmd) => cmd.clone(),
            None => DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Declared args, or the built-in default.
    pub fn args(&self) -> Vec<String> {
        match &self.args {
            Some(args) => args.clone(),
            None => DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Coarse lifecycle phase of the device, mirrored from its workload instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Created,
    Running,
    Error,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Unset => "unset",
            LifecyclePhase::Created => "created",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// Phase of the startup-config provisioning state machine.
///
/// `Unset` is the initial value; `NotProvided`, `Loaded` and `Failed` are
/// terminal; `Pending` is transient and retried every reconcile pass until a
/// terminal phase is reached. A terminal phase is never regressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupConfigPhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Loaded,
    NotProvided,
    Failed,
}

impl StartupConfigPhase {
    /// True for phases the state machine never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StartupConfigPhase::Loaded
                | StartupConfigPhase::NotProvided
                | StartupConfigPhase::Failed
        )
    }
}

impl fmt::Display for StartupConfigPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StartupConfigPhase::Unset => "unset",
            StartupConfigPhase::Pending => "pending",
            StartupConfigPhase::Loaded => "loaded",
            StartupConfigPhase::NotProvided => "not-provided",
            StartupConfigPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Startup-config portion of the device status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupConfigStatus {
    pub phase: StartupConfigPhase,
}

/// Observed state of a managed device.
///
/// Written back as one atomic value per reconcile pass, never field-by-field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStatus {
    /// Image the workload instance runs with.
    pub image: String,
    /// Lifecycle phase mirrored from the workload instance.
    pub phase: LifecyclePhase,
    /// Startup-config provisioning status.
    pub startup_config: StartupConfigStatus,
    /// True once the device management plane is ready to receive config.
    pub ready: bool,
}

/// Declarative resource describing a desired device instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedDevice {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub spec: DeviceSpec,
    #[serde(default)]
    pub status: DeviceStatus,
    /// License key assigned for this device, matching a key of the license
    /// credential object. Computed per reconcile pass, never persisted.
    #[serde(skip)]
    pub license_key: String,
}

impl ManagedDevice {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_accessors_fall_back_to_defaults() {
        let spec = DeviceSpec::default();

        assert_eq!(spec.model(), DEFAULT_MODEL);
        assert_eq!(spec.constraints().get("cpu").unwrap(), "500Mi");
        assert!(!spec.config().config_data_present);
        assert_eq!(spec.config().command()[0], "/tini");
    }

    #[test]
    fn spec_accessors_prefer_declared_values() {
        let spec = DeviceSpec {
            config: Some(DeviceConfig {
                command: Some(vec!["/bin/device".to_string()]),
                ..Default::default()
            }),
            model: "ixr-6e".to_string(),
            constraints: Some(HashMap::from([(
                "cpu".to_string(),
                "2".to_string(),
            )])),
            ..Default::default()
        };

        assert_eq!(spec.model(), "ixr-6e");
        assert_eq!(spec.constraints().get("cpu").unwrap(), "2");
        assert_eq!(spec.config().command(), vec!["/bin/device".to_string()]);
    }

    #[test]
    fn startup_config_phase_terminality() {
        assert!(!StartupConfigPhase::Unset.is_terminal());
        assert!(!StartupConfigPhase::Pending.is_terminal());
        assert!(StartupConfigPhase::Loaded.is_terminal());
        assert!(StartupConfigPhase::NotProvided.is_terminal());
        assert!(StartupConfigPhase::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_phases_as_kebab_case() {
        let status = DeviceStatus {
            startup_config: StartupConfigStatus {
                phase: StartupConfigPhase::NotProvided,
            },
            ..Default::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["startup_config"]["phase"], "not-provided");
        assert_eq!(json["phase"], "");
    }
}
