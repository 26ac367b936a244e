//! The per-device reconciliation engine.
//!
//! One `reconcile` invocation drives a device resource from "declared" to
//! "running with correct observed status": on first sight it ensures the
//! namespace bootstrap objects and the license credential copy, materializes
//! and creates the workload instance; on later passes it mirrors the
//! instance state into the device status and, once the instance is ready,
//! advances the startup-config state machine.
//!
//! The engine is a pure function over the injected store: any event loop or
//! work queue can drive it, and invocations for distinct devices are safe to
//! run concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapAssets, ConfigObjectEnsurer};
use crate::device::{LifecyclePhase, ManagedDevice};
use crate::instance::{InstancePhase, WorkloadInstance};
use crate::license::{assign_license_key, LicenseError, LicenseProvisioner};
use crate::materialize::Materializer;
use crate::provision::StartupConfigStateMachine;
use crate::session::{Credentials, SessionFactory};
use crate::store::{ObjectRef, Store, StoreError};

/// What the dispatcher should do after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing further to do until the next change event.
    Done,
    /// Re-run immediately; the pass made progress that needs a follow-up.
    Requeue,
    /// Re-run after the given delay.
    RequeueAfter(Duration),
}

/// Orchestrates all per-device convergence steps.
pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    materializer: Arc<dyn Materializer>,
    bootstrap: ConfigObjectEnsurer,
    licenses: LicenseProvisioner,
    startup_config: StartupConfigStateMachine,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        materializer: Arc<dyn Materializer>,
        sessions: Arc<dyn SessionFactory>,
        assets: BootstrapAssets,
        credentials: Credentials,
        shutdown: CancellationToken,
    ) -> Self {
        ReconciliationEngine {
            bootstrap: ConfigObjectEnsurer::new(store.clone(), assets),
            licenses: LicenseProvisioner::new(store.clone()),
            startup_config: StartupConfigStateMachine::new(
                store.clone(),
                sessions,
                credentials,
                shutdown,
            ),
            store,
            materializer,
        }
    }

    /// Replace the startup-config state machine, for tests and harnesses
    /// that need different poll bounds.
    pub fn with_startup_config(mut self, machine: StartupConfigStateMachine) -> Self {
        self.startup_config = machine;
        self
    }

    /// Run one reconcile pass for the referenced device.
    ///
    /// Safe under at-least-once invocation: every creation is existence
    /// checked and status writes are full-value and never regress a
    /// terminal startup-config phase.
    pub async fn reconcile(&self, id: &ObjectRef) -> Result<Outcome> {
        let mut device = match self.store.get_device(id).await {
            Ok(device) => device,
            Err(err) if err.is_not_found() => {
                // deleted after the trigger fired; dependents are garbage
                // collected externally
                info!("device {} not found, ignoring", id);
                return Ok(Outcome::Done);
            }
            Err(err) => return Err(err).with_context(|| format!("fetching device {id}")),
        };

        let instance = match self.store.get_instance(id).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => {
                return self.create_instance(&mut device).await;
            }
            Err(err) => return Err(err).with_context(|| format!("fetching instance {id}")),
        };

        if self.sync_status(&mut device, &instance) {
            self.persist_status(&mut device)
                .await
                .with_context(|| format!("updating status of {id}"))?;
        }

        if !device.status.ready {
            debug!("device {} not ready yet", id);
            return Ok(Outcome::Done);
        }

        if self.startup_config.advance(&mut device).await {
            self.persist_status(&mut device)
                .await
                .with_context(|| format!("updating status of {id}"))?;
        }

        Ok(Outcome::Done)
    }

    /// First pass for a device: ensure namespace collaterals, materialize
    /// the launch spec and create the workload instance.
    ///
    /// All steps are idempotent, so a failed pass is safe to retry from the
    /// top.
    async fn create_instance(&self, device: &mut ManagedDevice) -> Result<Outcome> {
        let id = device.object_ref();

        self.bootstrap
            .ensure(&device.namespace)
            .await
            .with_context(|| format!("ensuring bootstrap objects in {}", device.namespace))?;

        let credential = match self.licenses.ensure_credential(&device.namespace).await {
            Ok(credential) => credential,
            Err(LicenseError::ProvisioningFailed(reason)) => {
                // blocks licensing only; the workload is still created
                warn!("license provisioning for {} failed: {}", id, reason);
                None
            }
            Err(LicenseError::Store(err)) => {
                return Err(err).with_context(|| format!("ensuring license credential for {id}"));
            }
        };

        let version = crate::version::resolve_image_version(&device.spec);
        assign_license_key(device, credential.as_ref(), &version);

        let spec = self.materializer.build_instance_spec(device);
        let instance = WorkloadInstance {
            name: device.name.clone(),
            namespace: device.namespace.clone(),
            spec,
            status: Default::default(),
        };

        info!("creating workload instance for {}", id);

        match self.store.create_instance(instance).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {
                debug!("workload instance for {} already exists", id);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("creating workload instance for {id}"));
            }
        }

        Ok(Outcome::Requeue)
    }

    /// Mirror the instance state into the device status value.
    ///
    /// Returns true when the status changed and needs to be persisted.
    fn sync_status(&self, device: &mut ManagedDevice, instance: &WorkloadInstance) -> bool {
        let mut next = device.status.clone();
        next.image = instance.spec.image.clone();
        next.phase = lifecycle_phase(instance.status.phase);
        next.ready = instance.status.ready;

        if next == device.status {
            return false;
        }

        debug!(
            "device {} status changed: image={} phase={} ready={}",
            device.object_ref(),
            next.image,
            next.phase,
            next.ready
        );
        device.status = next;
        true
    }

    /// Persist the device status as one atomic write.
    ///
    /// A terminal startup-config phase already stored wins over anything
    /// this pass computed, so a stale concurrent pass can never regress it.
    async fn persist_status(&self, device: &mut ManagedDevice) -> Result<(), StoreError> {
        let id = device.object_ref();

        match self.store.get_device(&id).await {
            Ok(stored) => {
                let stored_phase = stored.status.startup_config.phase;
                if stored_phase.is_terminal()
                    && stored_phase != device.status.startup_config.phase
                {
                    warn!(
                        "refusing to regress startup config phase of {} from {} to {}",
                        id, stored_phase, device.status.startup_config.phase
                    );
                    device.status.startup_config = stored.status.startup_config;
                }
            }
            Err(err) if err.is_not_found() => {
                debug!("device {} deleted mid-pass, dropping status write", id);
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        self.store.update_device_status(device).await
    }
}

fn lifecycle_phase(phase: InstancePhase) -> LifecyclePhase {
    match phase {
        InstancePhase::Pending => LifecyclePhase::Created,
        InstancePhase::Running => LifecyclePhase::Running,
        InstancePhase::Succeeded | InstancePhase::Failed | InstancePhase::Unknown => {
            LifecyclePhase::Error
        }
    }
}
