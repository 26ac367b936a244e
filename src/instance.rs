//! Workload instance types.
//!
//! A `WorkloadInstance` is the runtime unit that executes a device image. The
//! engine creates it once from a materialized launch specification and only
//! reads it afterwards; its status is maintained by the external runtime.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Launch specification for a workload instance.
///
/// Built by a [`crate::materialize::Materializer`] and consumed opaquely via
/// the store; the engine itself only ever reads `image` back out of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub init: InitSpec,
    pub constraints: HashMap<String, String>,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<Mount>,
}

/// Init-container descriptor: waits for the expected number of interfaces to
/// be wired before the device process starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitSpec {
    pub image: String,
    pub wait_for_interfaces: u32,
    pub sleep: u32,
}

/// A volume attached to the instance, sourced from a bootstrap config object
/// or from the license credential object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeSource {
    ConfigObject {
        name: String,
        /// Single item to project out of the object, when not all of it.
        item: Option<String>,
    },
    Credential {
        name: String,
        key: String,
    },
}

/// Mount of a named volume into the instance filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub volume: String,
    pub path: String,
    pub sub_path: Option<String>,
    pub read_only: bool,
}

/// Phase reported by the runtime for a workload instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstancePhase {
    /// Accepted by the runtime but not running yet; the initial phase.
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstancePhase::Pending => "pending",
            InstancePhase::Running => "running",
            InstancePhase::Succeeded => "succeeded",
            InstancePhase::Failed => "failed",
            InstancePhase::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Observed state of a workload instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceStatus {
    /// Network address assigned to the instance; empty until assigned.
    pub address: String,
    pub phase: InstancePhase,
    /// Primary-container readiness.
    pub ready: bool,
}

/// The runtime unit executing a device image, sharing its device's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub name: String,
    pub namespace: String,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}
