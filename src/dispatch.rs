//! Work queue driving the reconciliation engine.
//!
//! Change events arrive as device refs on an unbounded channel. Each event
//! spawns a worker that holds a per-device lock, so reconciles of the same
//! device are serialized while distinct devices run concurrently — one
//! device blocked in a bounded wait cannot stall the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{Outcome, ReconciliationEngine};
use crate::store::ObjectRef;

/// Delay before retrying a device whose reconcile pass returned an error.
const ERROR_RETRY_BACKOFF: Duration = Duration::from_secs(5);

type DeviceLocks = Arc<Mutex<HashMap<ObjectRef, Arc<tokio::sync::Mutex<()>>>>>;

/// Enqueues change events for the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<ObjectRef>,
}

impl DispatchHandle {
    pub fn enqueue(&self, id: ObjectRef) {
        // a send error means the dispatcher is shutting down
        let _ = self.tx.send(id);
    }
}

/// Drives the engine from a queue of change events.
pub struct Dispatcher {
    engine: Arc<ReconciliationEngine>,
    locks: DeviceLocks,
    tx: mpsc::UnboundedSender<ObjectRef>,
    rx: mpsc::UnboundedReceiver<ObjectRef>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(engine: Arc<ReconciliationEngine>, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Dispatcher {
            engine,
            locks: Arc::new(Mutex::new(HashMap::new())),
            tx,
            rx,
            shutdown,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run until the shutdown token fires, then drain in-flight workers.
    pub async fn run(mut self) {
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe_id = self.rx.recv() => {
                    let Some(id) = maybe_id else { break };
                    workers.spawn(process(
                        self.engine.clone(),
                        self.locks.clone(),
                        self.handle(),
                        self.shutdown.clone(),
                        id,
                    ));
                }
            }
        }

        info!("dispatcher shutting down, draining workers");
        while workers.join_next().await.is_some() {}
    }
}

async fn process(
    engine: Arc<ReconciliationEngine>,
    locks: DeviceLocks,
    handle: DispatchHandle,
    shutdown: CancellationToken,
    id: ObjectRef,
) {
    let lock = {
        let mut locks = locks.lock().expect("device lock map poisoned");
        locks.entry(id.clone()).or_default().clone()
    };
    let _serialized = lock.lock().await;

    debug!("reconciling {}", id);

    let outcome = match engine.reconcile(&id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("reconciliation of {} failed: {:#}", id, err);
            Outcome::RequeueAfter(ERROR_RETRY_BACKOFF)
        }
    };

    match outcome {
        Outcome::Done => {}
        Outcome::Requeue => handle.enqueue(id),
        Outcome::RequeueAfter(delay) => {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(delay) => handle.enqueue(id),
            }
        }
    }
}
