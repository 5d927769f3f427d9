//! In-process [`ContentStore`] for tests, behind the `test-utils` feature.
//!
//! Content ids are derived from a sha256 of the data, so identical bytes
//! always map to the same id. Every call is recorded, and individual
//! operations can be scripted or made to fail.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{AddedEntry, ConfigValue, ContentStore, StoreError};
use crate::content_id::ContentId;

const PIN_TYPE: &str = "recursive";

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<ContentId, Vec<u8>>,
    pins: HashSet<ContentId>,
    peers: Vec<String>,
    config: HashMap<String, ConfigValue>,

    scripted_adds: HashMap<PathBuf, Vec<AddedEntry>>,
    failing_adds: HashSet<PathBuf>,
    failing_pins: HashSet<ContentId>,
    failing_gets: HashSet<ContentId>,
    get_delay: Duration,

    add_calls: Vec<PathBuf>,
    pin_calls: Vec<ContentId>,
    get_calls: Vec<(ContentId, PathBuf)>,

    in_flight: HashMap<ContentId, usize>,
    max_in_flight: usize,
}

/// Cloning yields a handle onto the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content id the store assigns to `data`.
    pub fn cid_for(data: &[u8]) -> ContentId {
        let digest = Sha256::digest(data);
        ContentId::new(format!("mem{}", hex::encode(digest)))
            .unwrap_or_else(|_| unreachable!("hex digest contains no whitespace"))
    }

    /// Store `data` under an explicit id, as if another node had added it.
    pub fn insert_blob(&self, cid: &ContentId, data: impl Into<Vec<u8>>) {
        self.inner.lock().blobs.insert(cid.clone(), data.into());
    }

    /// Make the next `add` of `path` report exactly `entries`. If `path` is a
    /// file, its bytes are stored under every scripted id.
    pub fn script_add(&self, path: impl Into<PathBuf>, entries: Vec<(&str, &str)>) {
        let entries = entries
            .into_iter()
            .map(|(name, cid)| AddedEntry {
                name: name.to_string(),
                cid: ContentId::new(cid).unwrap_or_else(|e| panic!("scripted cid: {}", e)),
            })
            .collect();
        self.inner.lock().scripted_adds.insert(path.into(), entries);
    }

    pub fn fail_add(&self, path: impl Into<PathBuf>) {
        self.inner.lock().failing_adds.insert(path.into());
    }

    pub fn fail_pin(&self, cid: &ContentId) {
        self.inner.lock().failing_pins.insert(cid.clone());
    }

    pub fn fail_get(&self, cid: &ContentId) {
        self.inner.lock().failing_gets.insert(cid.clone());
    }

    /// Hold every `get` for `delay` so overlapping fetches become observable.
    pub fn set_get_delay(&self, delay: Duration) {
        self.inner.lock().get_delay = delay;
    }

    pub fn set_peers(&self, peers: Vec<String>) {
        self.inner.lock().peers = peers;
    }

    pub fn is_pinned(&self, cid: &ContentId) -> bool {
        self.inner.lock().pins.contains(cid)
    }

    pub fn config_value(&self, key: &str) -> Option<ConfigValue> {
        self.inner.lock().config.get(key).cloned()
    }

    pub fn add_calls(&self) -> Vec<PathBuf> {
        self.inner.lock().add_calls.clone()
    }

    pub fn pin_calls(&self) -> Vec<ContentId> {
        self.inner.lock().pin_calls.clone()
    }

    pub fn get_calls(&self) -> Vec<(ContentId, PathBuf)> {
        self.inner.lock().get_calls.clone()
    }

    /// Highest number of concurrent `get`s observed for a single id.
    pub fn max_in_flight_per_cid(&self) -> usize {
        self.inner.lock().max_in_flight
    }

    fn failed(op: &'static str, detail: String) -> StoreError {
        StoreError::CommandFailed {
            op,
            code: Some(1),
            stderr: detail,
        }
    }
}

fn read_tree(path: &Path, prefix: &str, out: &mut Vec<(String, Vec<u8>)>) -> std::io::Result<()> {
    if path.is_dir() {
        let mut children: Vec<_> = std::fs::read_dir(path)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        children.sort();
        let mut listing = Vec::new();
        for child in children {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            listing.extend_from_slice(name.as_bytes());
            read_tree(&child, &format!("{}/{}", prefix, name), out)?;
        }
        out.push((prefix.to_string(), listing));
    } else {
        out.push((prefix.to_string(), std::fs::read(path)?));
    }
    Ok(())
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn add(&self, path: &Path) -> Result<Vec<AddedEntry>, StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.add_calls.push(path.to_path_buf());
            if inner.failing_adds.contains(path) {
                return Err(Self::failed("add", format!("cannot add {}", path.display())));
            }
        }

        let scripted = self.inner.lock().scripted_adds.remove(path);
        if let Some(entries) = scripted {
            if path.is_file() {
                let data = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
                let mut inner = self.inner.lock();
                for entry in &entries {
                    inner.blobs.insert(entry.cid.clone(), data.clone());
                }
            }
            return Ok(entries);
        }

        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut tree = Vec::new();
        read_tree(path, &root_name, &mut tree).map_err(|e| StoreError::io(path, e))?;

        let mut inner = self.inner.lock();
        Ok(tree
            .into_iter()
            .map(|(name, data)| {
                let cid = Self::cid_for(&data);
                inner.blobs.insert(cid.clone(), data);
                AddedEntry { name, cid }
            })
            .collect())
    }

    async fn pin(&self, cid: &ContentId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.pin_calls.push(cid.clone());
        if inner.failing_pins.contains(cid) {
            return Err(Self::failed("pin add", format!("cannot pin {}", cid)));
        }
        if !inner.blobs.contains_key(cid) {
            return Err(StoreError::NotFound(cid.clone()));
        }
        inner.pins.insert(cid.clone());
        Ok(())
    }

    async fn get(&self, cid: &ContentId, dest: &Path) -> Result<(), StoreError> {
        let (data, delay) = {
            let mut inner = self.inner.lock();
            inner.get_calls.push((cid.clone(), dest.to_path_buf()));
            let count = inner.in_flight.entry(cid.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            inner.max_in_flight = inner.max_in_flight.max(count);
            (inner.blobs.get(cid).cloned(), inner.get_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let failing = self.inner.lock().failing_gets.contains(cid);
            match data {
                _ if failing => Err(Self::failed("get", format!("cannot fetch {}", cid))),
                None => Err(StoreError::NotFound(cid.clone())),
                Some(data) => tokio::fs::write(dest, data)
                    .await
                    .map_err(|e| StoreError::io(dest, e)),
            }
        };

        if let Some(count) = self.inner.lock().in_flight.get_mut(cid) {
            *count -= 1;
        }
        result
    }

    async fn id(&self) -> Result<String, StoreError> {
        Ok("memory-node".to_string())
    }

    async fn peers(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().peers.clone())
    }

    async fn find_peers(&self, peer: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        if inner.peers.iter().any(|p| p.ends_with(peer)) {
            Ok(vec![peer.to_string()])
        } else {
            Err(Self::failed("routing findpeer", format!("{} not found", peer)))
        }
    }

    async fn config_set(&self, key: &str, value: &ConfigValue) -> Result<(), StoreError> {
        self.inner
            .lock()
            .config
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn pinned(&self) -> Result<HashMap<ContentId, String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .pins
            .iter()
            .map(|cid| (cid.clone(), PIN_TYPE.to_string()))
            .collect())
    }
}
