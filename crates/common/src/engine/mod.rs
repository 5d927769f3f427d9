//! The sync engine: owns the mapping and the deletion ledger and performs
//! every operation that reads or mutates them.
//!
//! An [`Engine`] is not shared. The daemon hands it to a single worker task
//! (see [`crate::worker`]) and everything else talks to that worker through
//! jobs, so no reconciliation pass can observe a mapping that is halfway
//! through an ingestion.

mod audit;
mod ingest;
mod reconcile;
mod scan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use audit::{Audit, AuditEntry};
pub use ingest::{DropReason, IngestError, IngestOutcome, IngestReport};
pub use reconcile::{is_partial_fetch, SyncReport};
pub use scan::ScanReport;

use crate::content_id::ContentId;
use crate::path_key::PathKey;
use crate::state::{DeletionLedger, LedgerStore, Mapping, MappingStore, StateError};
use crate::store::ContentStore;

/// Behavioral knobs for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Directory new files are picked up from
    pub source_root: PathBuf,
    /// Directory content is fetched back into
    pub mirror_root: PathBuf,
    /// Delete a source file once it has been ingested and reconciled
    pub consume_source: bool,
    /// Only mirror keys with one of these extensions; empty mirrors everything
    pub include_extensions: Vec<String>,
    /// How long a file's size and mtime must hold still before it is added
    pub settle_delay: Duration,
    /// Upper bound on concurrent fetches during a reconciliation pass
    pub max_concurrent_fetches: usize,
}

impl SyncSettings {
    pub fn new(source_root: impl Into<PathBuf>, mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            mirror_root: mirror_root.into(),
            consume_source: false,
            include_extensions: Vec::new(),
            settle_delay: Duration::from_millis(250),
            max_concurrent_fetches: 4,
        }
    }

    fn includes(&self, key: &PathKey) -> bool {
        if self.include_extensions.is_empty() {
            return true;
        }
        key.extension().is_some_and(|ext| {
            self.include_extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
    }
}

#[derive(Debug)]
pub struct Engine<S: ContentStore> {
    settings: SyncSettings,
    store: S,
    mappings: MappingStore,
    ledger_store: LedgerStore,
    mapping: Mapping,
    ledger: DeletionLedger,
    /// Content ids pinned by this process; spares redundant pin calls.
    pinned: HashSet<ContentId>,
}

impl<S: ContentStore> Engine<S> {
    /// Build an engine, loading the mapping and ledger from disk.
    pub fn new(
        settings: SyncSettings,
        store: S,
        mappings: MappingStore,
        ledger_store: LedgerStore,
    ) -> Self {
        let mut mapping = mappings.load();
        let ledger = ledger_store.load();

        // Older snapshots keyed entries by `<source dir name>/<path>`
        if let Some(root) = settings.source_root.file_name().and_then(|n| n.to_str()) {
            let migrated = mapping.strip_root_prefix(root);
            if migrated > 0 {
                tracing::info!(migrated, root, "Rewrote mapping keys relative to the source root");
                if let Err(e) = mappings.save(&mapping) {
                    tracing::error!(error = %e, "Failed to persist migrated mapping");
                }
            }
        }

        tracing::info!(
            mapped = mapping.len(),
            tombstoned = ledger.len(),
            source = %settings.source_root.display(),
            mirror = %settings.mirror_root.display(),
            "Sync engine loaded state"
        );

        Self {
            settings,
            store,
            mappings,
            ledger_store,
            mapping,
            ledger,
            pinned: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn ledger(&self) -> &DeletionLedger {
        &self.ledger
    }

    /// Record that the mirror copy at `path` was deleted by the user.
    ///
    /// Paths outside the mirror root and our own partial-fetch temp files are
    /// ignored. Returns the key if a new tombstone was written.
    pub fn tombstone(&mut self, path: &Path) -> Result<Option<PathKey>, StateError> {
        if is_partial_fetch(path) {
            return Ok(None);
        }

        let key = match PathKey::within(&self.settings.mirror_root, path) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    reason = %e,
                    "Ignoring deletion outside mirror"
                );
                return Ok(None);
            }
        };

        if self.ledger_store.append(&mut self.ledger, key.clone())? {
            Ok(Some(key))
        } else {
            Ok(None)
        }
    }

    fn save_mapping(&self) -> Result<(), StateError> {
        self.mappings.save(&self.mapping).map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::store::MemoryContentStore;

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub store: MemoryContentStore,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("Upload")).unwrap();
            std::fs::create_dir_all(dir.path().join("Synced_dir")).unwrap();
            Self {
                dir,
                store: MemoryContentStore::new(),
            }
        }

        pub fn source(&self) -> PathBuf {
            self.dir.path().join("Upload")
        }

        pub fn mirror(&self) -> PathBuf {
            self.dir.path().join("Synced_dir")
        }

        pub fn settings(&self) -> SyncSettings {
            let mut settings = SyncSettings::new(self.source(), self.mirror());
            settings.settle_delay = Duration::ZERO;
            settings
        }

        pub fn mapping_store(&self) -> MappingStore {
            MappingStore::new(
                self.dir.path().join("data").join("file_cid_mapping.json"),
                self.dir.path().join("data").join("backups"),
            )
        }

        pub fn ledger_store(&self) -> LedgerStore {
            LedgerStore::new(self.dir.path().join("data").join("deleted_files.json"))
        }

        pub fn engine(&self) -> Engine<MemoryContentStore> {
            self.engine_with(self.settings())
        }

        pub fn engine_with(&self, settings: SyncSettings) -> Engine<MemoryContentStore> {
            Engine::new(
                settings,
                self.store.clone(),
                self.mapping_store(),
                self.ledger_store(),
            )
        }

        pub fn write_source(&self, rel: &str, data: &[u8]) -> PathBuf {
            let path = self.source().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, data).unwrap();
            path
        }
    }

    pub fn key(s: &str) -> PathKey {
        PathKey::parse(s).unwrap()
    }

    pub fn cid(s: &str) -> ContentId {
        ContentId::new(s).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use crate::store::MemoryContentStore;

    #[test]
    fn test_extension_filter() {
        let mut settings = SyncSettings::new("/src", "/dst");
        assert!(settings.includes(&key("a.bin")));

        settings.include_extensions = vec![".txt".into(), "MD".into()];
        assert!(settings.includes(&key("a.txt")));
        assert!(settings.includes(&key("docs/readme.md")));
        assert!(!settings.includes(&key("a.bin")));
        assert!(!settings.includes(&key("Makefile")));
    }

    #[test]
    fn test_tombstone_records_mirror_relative_key() {
        let fx = Fixture::new();
        let mut engine = fx.engine();

        let recorded = engine
            .tombstone(&fx.mirror().join("docs").join("a.txt"))
            .unwrap();
        assert_eq!(recorded, Some(key("docs/a.txt")));
        assert!(fx.ledger_store().load().contains(&key("docs/a.txt")));

        // second deletion of the same path writes nothing new
        assert_eq!(
            engine.tombstone(&fx.mirror().join("docs").join("a.txt")).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_legacy_prefixed_keys_follow_tombstones() {
        let fx = Fixture::new();
        let cid1 = MemoryContentStore::cid_for(b"one");
        fx.store.insert_blob(&cid1, b"one".to_vec());
        let legacy: Mapping = [
            (key("Upload/a.txt"), cid1.clone()),
            (key("Upload/docs/b.txt"), cid1),
        ]
        .into_iter()
        .collect();
        fx.mapping_store().save(&legacy).unwrap();
        let mut ledger = fx.ledger_store().load();
        fx.ledger_store().append(&mut ledger, key("a.txt")).unwrap();

        let mut engine = fx.engine();
        assert!(engine.mapping().contains(&key("a.txt")));
        assert!(!engine.mapping().contains(&key("Upload/a.txt")));
        assert!(fx.mapping_store().load().contains(&key("docs/b.txt")));

        let report = engine.sync().await;
        assert_eq!(report.tombstoned, 1);
        assert_eq!(report.fetched, 1);
        assert!(!fx.mirror().join("a.txt").exists());
        assert!(fx.mirror().join("docs").join("b.txt").exists());
        assert!(!fx.mirror().join("Upload").exists());
    }

    #[test]
    fn test_tombstone_ignores_foreign_and_partial_paths() {
        let fx = Fixture::new();
        let mut engine = fx.engine();

        assert_eq!(engine.tombstone(&fx.source().join("a.txt")).unwrap(), None);
        assert_eq!(engine.tombstone(&fx.mirror()).unwrap(), None);
        assert_eq!(
            engine
                .tombstone(&fx.mirror().join(".a.txt.partial"))
                .unwrap(),
            None
        );
        assert!(engine.ledger().is_empty());
    }
}
