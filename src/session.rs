//! Command sessions to a device management plane.
//!
//! The concrete transport is a collaborator: this module only defines the
//! session traits the provisioning state machine drives, plus a dry-run
//! implementation for the lab harness that logs command batches instead of
//! dispatching them.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Built-in management credentials for lab devices. Rotation policy is out of
/// scope; every simulated device boots with these.
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "NetSim1!";

/// Credentials used to open a device session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

/// Errors raised while talking to a device.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The transport failed (connection refused, broken channel, ...).
    #[error("session transport failure: {0}")]
    Transport(String),
    /// The device accepted the channel but rejected a command.
    #[error("device rejected command: {0}")]
    Rejected(String),
}

/// An open command channel to a running device's management plane.
#[async_trait]
pub trait DeviceSession: Send {
    /// Dispatch a configuration command batch; an error means the whole
    /// batch is considered failed.
    async fn send_commands(&mut self, commands: &[String]) -> Result<(), SessionError>;

    /// Dispatch a single operational command and return its output.
    async fn send_command(&mut self, command: &str) -> Result<String, SessionError>;

    async fn close(&mut self);
}

/// Opens sessions to devices by address.
///
/// The management plane may lag behind the network address: an `open` call
/// can fail even though the address already accepts connections, so callers
/// poll until it succeeds.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn DeviceSession>, SessionError>;
}

/// Session factory for the lab harness: every open succeeds and dispatched
/// commands are logged instead of sent anywhere.
#[derive(Debug, Default)]
pub struct DryRunSessionFactory;

#[async_trait]
impl SessionFactory for DryRunSessionFactory {
    async fn open(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn DeviceSession>, SessionError> {
        debug!(
            "dry-run session opened to {} as {}",
            address, credentials.username
        );
        Ok(Box::new(DryRunSession {
            address: address.to_string(),
        }))
    }
}

struct DryRunSession {
    address: String,
}

#[async_trait]
impl DeviceSession for DryRunSession {
    async fn send_commands(&mut self, commands: &[String]) -> Result<(), SessionError> {
        for command in commands {
            info!("dry-run [{}]: {}", self.address, command);
        }
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String, SessionError> {
        info!("dry-run [{}]: {}", self.address, command);
        Ok(String::new())
    }

    async fn close(&mut self) {
        debug!("dry-run session to {} closed", self.address);
    }
}
