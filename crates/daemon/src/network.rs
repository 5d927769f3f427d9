//! Peer monitor: periodically log who we are connected to.

use std::time::Duration;

use tokio::sync::watch;

use common::ContentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerReport {
    pub connected: Vec<String>,
    /// Outcome of the routing lookup for the first peer, if one was made
    pub lookup_ok: Option<bool>,
}

/// Trailing component of a multiaddr, i.e. the peer id.
fn peer_id(addr: &str) -> &str {
    addr.rsplit('/').next().unwrap_or(addr)
}

/// List connected peers and look the first one up through the routing layer.
/// Failures are logged, never returned.
pub async fn check_peers<S: ContentStore>(store: &S) -> PeerReport {
    let connected = match store.peers().await {
        Ok(peers) => peers,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list connected peers");
            return PeerReport::default();
        }
    };

    tracing::info!(count = connected.len(), "Connected peers");
    for peer in &connected {
        tracing::debug!(peer = %peer, "Active connection");
    }

    let lookup_ok = match connected.first() {
        Some(first) => {
            let id = peer_id(first);
            match store.find_peers(id).await {
                Ok(found) => {
                    tracing::info!(peer = id, addrs = found.len(), "Routing lookup succeeded");
                    Some(true)
                }
                Err(e) => {
                    tracing::warn!(peer = id, error = %e, "Routing lookup failed");
                    Some(false)
                }
            }
        }
        None => None,
    };

    PeerReport {
        connected,
        lookup_ok,
    }
}

/// Run [`check_peers`] every `every` until shutdown.
pub async fn run_peer_monitor<S: ContentStore>(
    store: S,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_peers(&store).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Peer monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::store::MemoryContentStore;

    #[test]
    fn test_peer_id_from_multiaddr() {
        assert_eq!(peer_id("/ip4/10.0.0.2/tcp/4001/p2p/12D3KooWabc"), "12D3KooWabc");
        assert_eq!(peer_id("12D3KooWabc"), "12D3KooWabc");
    }

    #[tokio::test]
    async fn test_check_peers_looks_up_first_peer() {
        let store = MemoryContentStore::new();
        store.set_peers(vec![
            "/ip4/10.0.0.2/tcp/4001/p2p/PeerA".into(),
            "/ip4/10.0.0.3/tcp/4001/p2p/PeerB".into(),
        ]);

        let report = check_peers(&store).await;
        assert_eq!(report.connected.len(), 2);
        assert_eq!(report.lookup_ok, Some(true));
    }

    #[tokio::test]
    async fn test_check_peers_without_peers_skips_lookup() {
        let report = check_peers(&MemoryContentStore::new()).await;
        assert!(report.connected.is_empty());
        assert_eq!(report.lookup_ok, None);
    }
}
