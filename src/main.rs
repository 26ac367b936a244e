use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

mod bootstrap;
mod device;
mod dispatch;
mod engine;
mod instance;
mod license;
mod materialize;
mod provision;
mod session;
mod store;
mod version;

use bootstrap::BootstrapAssets;
use device::ManagedDevice;
use dispatch::{DispatchHandle, Dispatcher};
use engine::ReconciliationEngine;
use instance::{InstancePhase, InstanceStatus};
use materialize::DefaultMaterializer;
use session::{Credentials, DryRunSessionFactory};
use store::{MemoryStore, Store};

/// Interval at which the lab simulator promotes created instances.
const SIMULATE_INTERVAL: Duration = Duration::from_secs(1);

/// netsimd - converges declared network-device resources with running workloads
#[derive(Parser)]
#[command(name = "netsimd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Topology file with the device resources to manage (JSON)
    #[arg(short, long)]
    topology: PathBuf,

    /// Simulate the external runtime: assign addresses and mark created
    /// instances ready
    #[arg(long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let devices = load_topology(&cli.topology)?;
    info!(
        "managing {} device(s) from {}",
        devices.len(),
        cli.topology.display()
    );

    let store = Arc::new(MemoryStore::new());
    let refs: Vec<_> = devices.iter().map(|d| d.object_ref()).collect();
    for d in devices {
        store.insert_device(d).await;
    }

    let shutdown = CancellationToken::new();
    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        Arc::new(DefaultMaterializer),
        Arc::new(DryRunSessionFactory),
        BootstrapAssets::builtin()?,
        Credentials::default(),
        shutdown.clone(),
    ));

    let dispatcher = Dispatcher::new(engine, shutdown.clone());
    let handle = dispatcher.handle();
    for id in refs {
        handle.enqueue(id);
    }

    if cli.simulate {
        tokio::spawn(simulate_runtime(
            store.clone(),
            handle.clone(),
            shutdown.clone(),
        ));
    }

    let run = tokio::spawn(dispatcher.run());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    shutdown.cancel();

    run.await.context("joining dispatcher")?;

    Ok(())
}

fn load_topology(path: &PathBuf) -> Result<Vec<ManagedDevice>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading topology file {}", path.display()))?;
    let devices: Vec<ManagedDevice> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing topology file {}", path.display()))?;
    Ok(devices)
}

/// Stand-in for the external runtime: workload instances get an address and
/// become ready shortly after creation, and their devices are re-enqueued
/// the way a watch trigger would.
async fn simulate_runtime(
    store: Arc<MemoryStore>,
    handle: DispatchHandle,
    shutdown: CancellationToken,
) {
    let mut next_host = 1u32;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(SIMULATE_INTERVAL) => {}
        }

        for id in store.instance_refs().await {
            let Ok(instance) = store.get_instance(&id).await else {
                continue;
            };
            if instance.status.ready {
                continue;
            }

            let address = format!("10.77.0.{next_host}");
            next_host += 1;

            debug!("simulator: instance {} up at {}", id, address);
            if store
                .set_instance_status(
                    &id,
                    InstanceStatus {
                        address,
                        phase: InstancePhase::Running,
                        ready: true,
                    },
                )
                .await
                .is_ok()
            {
                handle.enqueue(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn topology_file_parses_into_devices() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{
                    "name": "r1",
                    "namespace": "lab",
                    "spec": {{ "version": "21.11.1", "num_interfaces": 4 }}
                }},
                {{
                    "name": "r2",
                    "namespace": "lab",
                    "spec": {{
                        "config": {{
                            "config_file": "config.json",
                            "config_data_present": true
                        }}
                    }}
                }}
            ]"#
        )
        .unwrap();

        let devices = load_topology(&file.path().to_path_buf()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].spec.version, "21.11.1");
        assert!(devices[1].spec.config().config_data_present);
    }

    #[test]
    fn missing_topology_file_is_an_error() {
        let err = load_topology(&PathBuf::from("/nonexistent/topo.json")).unwrap_err();
        assert!(err.to_string().contains("topo.json"));
    }
}
