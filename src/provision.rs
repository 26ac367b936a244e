//! Startup-config provisioning state machine.
//!
//! Once a device's workload instance is ready, the machine drives the
//! declared startup configuration into the device: wait for the instance
//! address, wait for the management plane to accept a session, dispatch the
//! load commands and ensure the `initial` checkpoint exists. Phases follow
//! the lattice unset -> pending -> {loaded, not-provided, failed}; terminal
//! phases are never left and never regressed.
//!
//! The two bounded waits are the only intentional blocking points of a
//! reconcile pass; both honor the process shutdown token, and a timeout
//! returns the pass unchanged so the next trigger retries it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{ManagedDevice, StartupConfigPhase};
use crate::materialize::DEFAULT_CONFIG_PATH;
use crate::session::{Credentials, DeviceSession, SessionError, SessionFactory};
use crate::store::{ObjectRef, Store};

/// How long to wait for an instance address or a management session.
pub const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll interval for both waits.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Name of the device-side checkpoint taken after provisioning. Used as the
/// rollback point to the state the device booted with.
pub const CHECKPOINT_NAME: &str = "initial";

const CHECKPOINT_QUERY_CMD: &str = "info from state system configuration checkpoint *";
const CHECKPOINT_CREATE_CMD: &str = "/tools system configuration generate-checkpoint name initial";
const COMMIT_SAVE_CMD: &str = "commit save";

/// Errors that terminate provisioning with phase `failed`.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("unsupported startup config format: {0:?}")]
    UnsupportedConfigFormat(String),
}

/// Build the command batch that loads a startup config file.
///
/// The load command is chosen by file extension (`.json` is loaded, `.cli`
/// is sourced); the batch always ends with a commit-and-save.
pub fn startup_load_commands(file: &str, path: &str) -> Result<Vec<String>, ProvisionError> {
    let extension = Path::new(file).extension().and_then(|e| e.to_str());

    let load = match extension {
        Some("json") => format!("load file {path}/{file}"),
        Some("cli") => format!("source {path}/{file}"),
        _ => return Err(ProvisionError::UnsupportedConfigFormat(file.to_string())),
    };

    Ok(vec![load, COMMIT_SAVE_CMD.to_string()])
}

/// Drives a device through its startup-config provisioning phases.
pub struct StartupConfigStateMachine {
    store: Arc<dyn Store>,
    sessions: Arc<dyn SessionFactory>,
    credentials: Credentials,
    shutdown: CancellationToken,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl StartupConfigStateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<dyn SessionFactory>,
        credentials: Credentials,
        shutdown: CancellationToken,
    ) -> Self {
        StartupConfigStateMachine {
            store,
            sessions,
            credentials,
            shutdown,
            wait_timeout: READY_WAIT_TIMEOUT,
            poll_interval: READY_POLL_INTERVAL,
        }
    }

    /// Override the poll bounds, for tests and fast lab loops.
    pub fn with_wait_bounds(mut self, timeout: Duration, interval: Duration) -> Self {
        self.wait_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    /// Evaluate one provisioning step for a ready device.
    ///
    /// Returns true when the device status was mutated and needs to be
    /// persisted. Terminal phases are a no-op.
    pub async fn advance(&self, device: &mut ManagedDevice) -> bool {
        let id = device.object_ref();
        let phase = device.status.startup_config.phase;

        if phase.is_terminal() {
            debug!("startup config for {} already processed ({}), skipping", id, phase);
            return false;
        }

        let cfg = device.spec.config();
        let mut dirty = false;

        // mark the attempt so an interrupted pass is visibly retried
        if cfg.config_data_present && phase == StartupConfigPhase::Unset {
            device.status.startup_config.phase = StartupConfigPhase::Pending;
            dirty = true;
        }

        // the address and the management plane become ready independently;
        // a timeout on either defers the whole attempt to the next trigger
        let Some(address) = self.wait_instance_address(&id).await else {
            return dirty;
        };
        let Some(mut session) = self.wait_session_ready(&address).await else {
            return dirty;
        };

        if !cfg.config_data_present {
            info!("no startup config declared for {}", id);
            device.status.startup_config.phase = StartupConfigPhase::NotProvided;
            self.ensure_checkpoint(&id, session.as_mut()).await;
            session.close().await;
            return true;
        }

        let config_path = if cfg.config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            cfg.config_path.as_str()
        };

        let commands = match startup_load_commands(&cfg.config_file, config_path) {
            Ok(commands) => commands,
            Err(err) => {
                warn!("startup config for {} cannot be loaded: {}", id, err);
                device.status.startup_config.phase = StartupConfigPhase::Failed;
                session.close().await;
                return true;
            }
        };

        info!(
            "loading startup configuration for {} from {}/{}",
            id, config_path, cfg.config_file
        );

        match session.send_commands(&commands).await {
            Ok(()) => {
                info!("startup configuration for {} loaded", id);
                device.status.startup_config.phase = StartupConfigPhase::Loaded;
            }
            Err(err) => {
                // terminal; clearing the failed phase requires operator action
                error!("failed to load startup configuration for {}: {}", id, err);
                device.status.startup_config.phase = StartupConfigPhase::Failed;
            }
        }

        self.ensure_checkpoint(&id, session.as_mut()).await;
        session.close().await;

        true
    }

    /// Idempotently ensure the `initial` checkpoint exists on the device.
    ///
    /// The existence query runs first: the status carrying a terminal phase
    /// may not be durably persisted yet when the next pass arrives, and a
    /// second checkpoint must not be taken. Failures are logged without
    /// touching the provisioning phase.
    async fn ensure_checkpoint(&self, id: &ObjectRef, session: &mut dyn DeviceSession) {
        let existing = match session.send_command(CHECKPOINT_QUERY_CMD).await {
            Ok(output) => output,
            Err(err) => {
                error!("failed to query checkpoints on {}: {}", id, err);
                return;
            }
        };

        if existing.contains(CHECKPOINT_NAME) {
            info!("checkpoint {:?} already exists on {}, skipping", CHECKPOINT_NAME, id);
            return;
        }

        info!("creating checkpoint {:?} on {}", CHECKPOINT_NAME, id);

        if let Err(err) = session.send_command(CHECKPOINT_CREATE_CMD).await {
            error!("failed to create checkpoint on {}: {}", id, err);
        }
    }

    /// Poll the workload instance until it reports a network address.
    async fn wait_instance_address(&self, id: &ObjectRef) -> Option<String> {
        let deadline = time::Instant::now() + self.wait_timeout;
        let mut tick = time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested while waiting for {} address", id);
                    return None;
                }
                _ = time::sleep_until(deadline) => {
                    warn!("timed out waiting for {} address", id);
                    return None;
                }
                _ = tick.tick() => {
                    match self.store.get_instance(id).await {
                        Ok(instance) if !instance.status.address.is_empty() => {
                            debug!("instance {} has address {}", id, instance.status.address);
                            return Some(instance.status.address);
                        }
                        Ok(_) => {}
                        Err(err) => debug!("waiting for {} address: {}", id, err),
                    }
                }
            }
        }
    }

    /// Poll-open a management session to `address`.
    ///
    /// The address may accept connections before the management plane is
    /// ready, so open failures are expected while waiting.
    async fn wait_session_ready(&self, address: &str) -> Option<Box<dyn DeviceSession>> {
        let deadline = time::Instant::now() + self.wait_timeout;
        let mut tick = time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested while waiting for management plane at {}", address);
                    return None;
                }
                _ = time::sleep_until(deadline) => {
                    warn!("timed out waiting for management plane at {}", address);
                    return None;
                }
                _ = tick.tick() => {
                    match self.sessions.open(address, &self.credentials).await {
                        Ok(session) => {
                            info!("management session to {} established", address);
                            return Some(session);
                        }
                        Err(err) => debug!("management plane at {} not ready: {}", address, err),
                    }
                }
            }
        }
    }
}
