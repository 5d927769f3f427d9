//! Ingestion: address a new source file, record and pin it, then reconcile.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{Engine, SyncReport};
use crate::content_id::ContentId;
use crate::path_key::PathKey;
use crate::state::StateError;
use crate::store::{ContentStore, StoreError};

/// Rounds of settle checks before a file that keeps changing is added anyway.
const MAX_SETTLE_ROUNDS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to add {path}: {source}")]
    Add {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
    #[error("failed to pin {cid} for {key}: {source}")]
    Pin {
        key: PathKey,
        cid: ContentId,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Persist(#[from] StateError),
}

/// Why an ingestion request was dropped without touching the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OutsideSourceRoot,
    Missing,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Mapping entries written for this file
    pub entries: Vec<(PathKey, ContentId)>,
    /// The reconciliation pass that followed
    pub sync: SyncReport,
    /// Whether the source file was deleted afterwards
    pub consumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested(IngestReport),
    Dropped(DropReason),
}

pub(super) enum Recorded {
    Entries(Vec<(PathKey, ContentId)>),
    Dropped(DropReason),
}

impl<S: ContentStore> Engine<S> {
    /// Ingest the source file at `path`, then run one reconciliation pass.
    ///
    /// An `add` failure leaves the mapping untouched. A `pin` failure aborts
    /// the remaining entries, but the ones already recorded are persisted
    /// before the error is returned.
    pub async fn ingest(&mut self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let entries = match self.record(path).await? {
            Recorded::Entries(entries) => entries,
            Recorded::Dropped(reason) => return Ok(IngestOutcome::Dropped(reason)),
        };

        let sync = self.sync().await;
        let consumed = self.consume(path, &entries).await;

        Ok(IngestOutcome::Ingested(IngestReport {
            entries,
            sync,
            consumed,
        }))
    }

    /// Steps of ingestion up to and including the mapping save.
    pub(super) async fn record(&mut self, path: &Path) -> Result<Recorded, IngestError> {
        let key = match PathKey::within(&self.settings.source_root, path) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    reason = %e,
                    "Ignoring file outside source directory"
                );
                return Ok(Recorded::Dropped(DropReason::OutsideSourceRoot));
            }
        };

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                tracing::debug!(path = %key, "Ignoring directory");
                return Ok(Recorded::Dropped(DropReason::Directory));
            }
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(path = %key, "File vanished before ingestion");
                return Ok(Recorded::Dropped(DropReason::Missing));
            }
        }

        if !wait_until_settled(path, self.settings.settle_delay).await {
            tracing::debug!(path = %key, "File vanished while settling");
            return Ok(Recorded::Dropped(DropReason::Missing));
        }

        tracing::info!(path = %key, "Adding file to content store");
        let added = self
            .store
            .add(path)
            .await
            .map_err(|source| IngestError::Add {
                path: path.to_path_buf(),
                source,
            })?;

        let parent = key.parent();
        let mut entries = Vec::with_capacity(added.len());
        let mut failure = None;

        for entry in added {
            let entry_key = match &parent {
                Some(parent) => parent.join(&entry.name),
                None => PathKey::parse(&entry.name),
            };
            let entry_key = match entry_key {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(
                        name = %entry.name,
                        error = %e,
                        "Dropping add result with malformed name"
                    );
                    continue;
                }
            };
            if entry_key.under(&self.settings.source_root).is_dir() {
                continue;
            }

            self.mapping.insert(entry_key.clone(), entry.cid.clone());
            entries.push((entry_key.clone(), entry.cid.clone()));
            tracing::info!(path = %entry_key, cid = %entry.cid, "Recorded mapping");

            match self.store.pin(&entry.cid).await {
                Ok(()) => {
                    self.pinned.insert(entry.cid.clone());
                    tracing::info!(path = %entry_key, cid = %entry.cid, "Pinned file");
                }
                Err(source) => {
                    failure = Some(IngestError::Pin {
                        key: entry_key,
                        cid: entry.cid,
                        source,
                    });
                    break;
                }
            }
        }

        if !entries.is_empty() {
            self.save_mapping()?;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(Recorded::Entries(entries)),
        }
    }

    /// Delete the source file once every entry it produced has reached a
    /// final state in the mirror.
    pub(super) async fn consume(&self, path: &Path, entries: &[(PathKey, ContentId)]) -> bool {
        if !self.settings.consume_source || entries.is_empty() {
            return false;
        }

        let mirror_root = &self.settings.mirror_root;
        for (key, _) in entries {
            let done = !self.settings.includes(key)
                || self.ledger.contains(key)
                || key.under(mirror_root).exists();
            if !done {
                tracing::warn!(path = %key, "Not consuming source file, mirror copy missing");
                return false;
            }
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Consumed source file");
                true
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to delete consumed source file"
                );
                false
            }
        }
    }
}

fn fingerprint(meta: &std::fs::Metadata) -> (u64, Option<SystemTime>) {
    (meta.len(), meta.modified().ok())
}

/// Wait until size and mtime hold still across one `delay`. Returns false if
/// the file disappears.
async fn wait_until_settled(path: &Path, delay: Duration) -> bool {
    if delay.is_zero() {
        return true;
    }

    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    let mut last = fingerprint(&meta);

    for _ in 0..MAX_SETTLE_ROUNDS {
        tokio::time::sleep(delay).await;
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        let current = fingerprint(&meta);
        if current == last {
            return true;
        }
        last = current;
    }

    tracing::warn!(path = %path.display(), "File still changing, adding it anyway");
    true
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::*;
    use crate::store::MemoryContentStore;

    #[tokio::test]
    async fn test_ingest_records_pins_persists_and_syncs() {
        let fx = Fixture::new();
        let path = fx.write_source("notes.txt", b"my notes");
        fx.store.script_add(&path, vec![("notes.txt", "CID9")]);
        let mut engine = fx.engine();

        let outcome = engine.ingest(&path).await.unwrap();

        let IngestOutcome::Ingested(report) = outcome else {
            panic!("expected ingestion");
        };
        assert_eq!(report.entries, vec![(key("notes.txt"), cid("CID9"))]);
        assert_eq!(engine.mapping().get(&key("notes.txt")), Some(&cid("CID9")));
        assert_eq!(fx.store.pin_calls(), vec![cid("CID9")]);
        assert_eq!(
            fx.mapping_store().load().get(&key("notes.txt")),
            Some(&cid("CID9"))
        );
        // the triggered sync fetched the new entry into the mirror
        assert_eq!(report.sync.fetched, 1);
        assert_eq!(
            std::fs::read(fx.mirror().join("notes.txt")).unwrap(),
            b"my notes"
        );
        assert!(!report.consumed);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_ingest_nested_file_keys_from_parent() {
        let fx = Fixture::new();
        let path = fx.write_source("docs/2024/report.txt", b"q1");
        let mut engine = fx.engine();

        engine.ingest(&path).await.unwrap();

        let expected = MemoryContentStore::cid_for(b"q1");
        assert_eq!(
            engine.mapping().get(&key("docs/2024/report.txt")),
            Some(&expected)
        );
        assert!(fx.mirror().join("docs/2024/report.txt").exists());
    }

    #[tokio::test]
    async fn test_ingest_drops_paths_outside_source() {
        let fx = Fixture::new();
        let stray = fx.dir.path().join("stray.txt");
        std::fs::write(&stray, b"x").unwrap();
        let mut engine = fx.engine();

        let outcome = engine.ingest(&stray).await.unwrap();

        assert_eq!(outcome, IngestOutcome::Dropped(DropReason::OutsideSourceRoot));
        assert!(fx.store.add_calls().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_drops_missing_and_directories() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.source().join("empty")).unwrap();
        let mut engine = fx.engine();

        assert_eq!(
            engine.ingest(&fx.source().join("gone.txt")).await.unwrap(),
            IngestOutcome::Dropped(DropReason::Missing)
        );
        assert_eq!(
            engine.ingest(&fx.source().join("empty")).await.unwrap(),
            IngestOutcome::Dropped(DropReason::Directory)
        );
        assert!(fx.store.add_calls().is_empty());
    }

    #[tokio::test]
    async fn test_add_failure_leaves_prior_entry() {
        let fx = Fixture::new();
        let path = fx.write_source("a.txt", b"v1");
        let mut engine = fx.engine();
        engine.ingest(&path).await.unwrap();
        let before = engine.mapping().clone();

        std::fs::write(&path, b"v2").unwrap();
        fx.store.fail_add(&path);
        let err = engine.ingest(&path).await.unwrap_err();

        assert!(matches!(err, IngestError::Add { .. }));
        assert_eq!(engine.mapping(), &before);
        assert_eq!(fx.mapping_store().load(), before);
    }

    #[tokio::test]
    async fn test_pin_failure_keeps_recorded_entry() {
        let fx = Fixture::new();
        let path = fx.write_source("a.txt", b"alpha");
        fx.store.script_add(&path, vec![("a.txt", "CIDP")]);
        fx.store.fail_pin(&cid("CIDP"));
        let mut engine = fx.engine();

        let err = engine.ingest(&path).await.unwrap_err();

        assert!(matches!(err, IngestError::Pin { .. }));
        assert_eq!(fx.mapping_store().load().get(&key("a.txt")), Some(&cid("CIDP")));
        // no sync ran for the aborted file
        assert!(fx.store.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_reingest_overwrites_content_id() {
        let fx = Fixture::new();
        let path = fx.write_source("a.txt", b"v1");
        let mut engine = fx.engine();
        engine.ingest(&path).await.unwrap();

        std::fs::write(&path, b"v2").unwrap();
        engine.ingest(&path).await.unwrap();

        assert_eq!(
            engine.mapping().get(&key("a.txt")),
            Some(&MemoryContentStore::cid_for(b"v2"))
        );
        // one backup per save after the first
        let backups = std::fs::read_dir(fx.mapping_store().backups_dir())
            .unwrap()
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_consume_deletes_source_after_mirroring() {
        let fx = Fixture::new();
        let path = fx.write_source("a.txt", b"alpha");
        let mut settings = fx.settings();
        settings.consume_source = true;
        let mut engine = fx.engine_with(settings);

        let IngestOutcome::Ingested(report) = engine.ingest(&path).await.unwrap() else {
            panic!("expected ingestion");
        };

        assert!(report.consumed);
        assert!(!path.exists());
        assert!(fx.mirror().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_consume_keeps_source_when_fetch_fails() {
        let fx = Fixture::new();
        let path = fx.write_source("a.txt", b"alpha");
        fx.store.fail_get(&MemoryContentStore::cid_for(b"alpha"));
        let mut settings = fx.settings();
        settings.consume_source = true;
        let mut engine = fx.engine_with(settings);

        let IngestOutcome::Ingested(report) = engine.ingest(&path).await.unwrap() else {
            panic!("expected ingestion");
        };

        assert!(!report.consumed);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_settle_waits_for_stable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();

        assert!(wait_until_settled(&path, Duration::from_millis(5)).await);
        assert!(!wait_until_settled(&dir.path().join("nope"), Duration::from_millis(5)).await);
    }
}
