use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{read_json, write_atomic, StateError};
use crate::path_key::PathKey;

/// Mirror paths the user deleted. A key in here is never fetched again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionLedger(BTreeSet<PathKey>);

impl DeletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.0.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<PathKey> for DeletionLedger {
    fn from_iter<T: IntoIterator<Item = PathKey>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger; missing or corrupt files yield an empty ledger.
    pub fn load(&self) -> DeletionLedger {
        let Some(raw) = read_json::<Vec<String>>(&self.path, "deleted files ledger") else {
            return DeletionLedger::new();
        };

        raw.into_iter()
            .filter_map(|entry| match PathKey::parse(&entry) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(entry = %entry, error = %e, "Dropping invalid ledger entry");
                    None
                }
            })
            .collect()
    }

    /// Record a tombstone and persist the whole ledger.
    ///
    /// Returns `Ok(false)` when the key was already present (nothing written).
    /// If persisting fails the key stays in `ledger`, so the running process
    /// still honors it; the next successful append writes it out.
    pub fn append(&self, ledger: &mut DeletionLedger, key: PathKey) -> Result<bool, StateError> {
        if !ledger.0.insert(key.clone()) {
            return Ok(false);
        }

        self.save(ledger)?;
        tracing::info!(path = %key, ledger = %self.path.display(), "Recorded mirror deletion");
        Ok(true)
    }

    fn save(&self, ledger: &DeletionLedger) -> Result<(), StateError> {
        let entries: Vec<&str> = ledger.0.iter().map(PathKey::as_str).collect();
        let encoded = serde_json::to_vec_pretty(&entries).map_err(|source| StateError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &encoded)
    }
}
