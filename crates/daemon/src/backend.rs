//! Bring the Kubo node to a usable state before the engine starts.

use std::path::Path;

use common::store::{ConfigValue, ContentStore, KuboStore, StoreError};

use crate::state::BackendConfig;

const SWARM_KEY_FILE: &str = "swarm.key";
const MDNS_INTERVAL_SECS: &str = "30";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to initialize backend repository: {0}")]
    Init(#[source] StoreError),
    #[error("backend daemon is not reachable: {0}")]
    Unavailable(#[source] StoreError),
    #[error("failed to remove {path}: {source}")]
    SwarmKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to configure public network: {0}")]
    Network(#[source] StoreError),
}

/// Initialize the repository, make sure a daemon answers, optionally switch
/// to the public network, and return the node's peer id.
pub async fn bootstrap(
    store: &KuboStore,
    config: &BackendConfig,
) -> Result<String, BootstrapError> {
    store.init_repo().await.map_err(BootstrapError::Init)?;

    let peer_id = ensure_running(store, config).await?;

    if config.public_network {
        remove_swarm_key(&store.repo_dir())?;
        configure_public_network(store).await?;
    }

    tracing::info!(peer_id = %peer_id, "Backend node ready");
    Ok(peer_id)
}

async fn ensure_running(
    store: &KuboStore,
    config: &BackendConfig,
) -> Result<String, BootstrapError> {
    match store.probe(config.liveness_timeout()).await {
        Ok(peer_id) => {
            tracing::info!("Backend daemon is running");
            return Ok(peer_id);
        }
        Err(e) if config.spawn_daemon => {
            tracing::warn!(error = %e, "Backend daemon not responding, starting it");
        }
        Err(e) => return Err(BootstrapError::Unavailable(e)),
    }

    // the child keeps running on its own; we only talk to it through the CLI
    let _child = store.spawn_daemon().map_err(BootstrapError::Unavailable)?;
    tokio::time::sleep(config.startup_grace()).await;

    store
        .probe(config.liveness_timeout())
        .await
        .map_err(BootstrapError::Unavailable)
}

/// A private-network key keeps the node off the public swarm.
fn remove_swarm_key(repo: &Path) -> Result<(), BootstrapError> {
    let path = repo.join(SWARM_KEY_FILE);
    if !path.exists() {
        return Ok(());
    }
    std::fs::remove_file(&path).map_err(|source| BootstrapError::SwarmKey {
        path: path.display().to_string(),
        source,
    })?;
    tracing::info!(path = %path.display(), "Removed swarm key to join the public network");
    Ok(())
}

/// Enable DHT client routing and mDNS discovery. The mDNS interval is best
/// effort; older nodes reject the key.
pub async fn configure_public_network<S: ContentStore>(store: &S) -> Result<(), BootstrapError> {
    store
        .config_set("Routing.Type", &ConfigValue::String("dhtclient".into()))
        .await
        .map_err(BootstrapError::Network)?;
    tracing::info!("DHT client routing enabled");

    store
        .config_set("Discovery.MDNS.Enabled", &ConfigValue::Bool(true))
        .await
        .map_err(BootstrapError::Network)?;
    tracing::info!("mDNS discovery enabled");

    match store
        .config_set(
            "Discovery.MDNS.Interval",
            &ConfigValue::Json(MDNS_INTERVAL_SECS.into()),
        )
        .await
    {
        Ok(()) => tracing::info!(secs = MDNS_INTERVAL_SECS, "mDNS interval set"),
        Err(e) => tracing::warn!(error = %e, "Could not set mDNS interval, keeping node default"),
    }
    Ok(())
}
