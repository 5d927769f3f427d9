//! Wires the engine worker, watcher, periodic loop and peer monitor
//! together and runs them until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use common::store::KuboStore;
use common::{run_worker, Engine, JobDispatcher};

use crate::backend;
use crate::network;
use crate::state::AppState;
use crate::watcher::{SyncWatcher, WatchRoots};

/// Broadcasts shutdown to every background loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Every `every`: audit pins, then sync. The first tick is skipped because
/// the startup scan already ends in a sync. A tick is skipped while the
/// previous pass is still waiting in the queue.
pub async fn run_periodic(
    dispatcher: JobDispatcher,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match dispatcher.dispatch_periodic() {
                    Ok(true) => tracing::debug!("Queued periodic audit and sync"),
                    Ok(false) => tracing::debug!("Previous pass still queued, skipping tick"),
                    Err(_) => {
                        tracing::warn!("Engine worker gone, stopping periodic loop");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Periodic loop stopped");
}

/// Run the daemon until ctrl-c.
///
/// Backend or watcher problems are logged and the daemon keeps going: the
/// periodic loop retries every pass until the backend comes back.
pub async fn spawn_service(state: AppState) -> anyhow::Result<()> {
    tracing::info!(
        home = %state.home.display(),
        source = %state.source_dir.display(),
        mirror = %state.mirror_dir.display(),
        "Starting mirrorsync"
    );

    let store = KuboStore::new(state.config.backend.kubo_config());
    if let Err(e) = backend::bootstrap(&store, &state.config.backend).await {
        tracing::error!(error = %e, "Backend bootstrap failed, continuing");
    }

    let engine = Engine::new(
        state.sync_settings(),
        store.clone(),
        state.mapping_store(),
        state.ledger_store(),
    );
    let (dispatcher, receiver) = JobDispatcher::new();
    let worker = tokio::spawn(run_worker(engine, receiver));

    dispatcher.dispatch_startup_scan()?;

    let watcher = match SyncWatcher::start(
        WatchRoots {
            source: state.source_dir.clone(),
            mirror: state.mirror_dir.clone(),
        },
        dispatcher.clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::error!(error = %e, "Filesystem watcher unavailable, relying on periodic sync");
            None
        }
    };

    let shutdown = ShutdownHandle::new();
    let periodic = tokio::spawn(run_periodic(
        dispatcher.clone(),
        state.config.sync_interval(),
        shutdown.subscribe(),
    ));
    let monitor = tokio::spawn(network::run_peer_monitor(
        store,
        state.config.peer_monitor_interval(),
        shutdown.subscribe(),
    ));

    tracing::info!("mirrorsync running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    shutdown.trigger();
    let _ = tokio::join!(periodic, monitor);
    drop(watcher);
    drop(dispatcher);

    let engine = worker.await?;
    tracing::info!(mapped = engine.mapping().len(), "Engine worker drained");
    Ok(())
}
