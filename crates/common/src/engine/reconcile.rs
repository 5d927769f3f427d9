//! Reconciliation: make the mirror hold every mapped, non-tombstoned entry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};

use super::Engine;
use crate::content_id::ContentId;
use crate::path_key::PathKey;
use crate::store::{ContentStore, StoreError};

const PARTIAL_SUFFIX: &str = ".partial";

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries fetched into the mirror
    pub fetched: usize,
    /// Entries skipped because the user deleted them from the mirror
    pub tombstoned: usize,
    /// Entries skipped because the mirror already has a file there
    pub present: usize,
    /// Entries excluded by the extension filter
    pub filtered: usize,
    /// Entries whose fetch failed; retried on the next pass
    pub failed: usize,
}

impl SyncReport {
    pub fn is_converged(&self) -> bool {
        self.failed == 0
    }
}

/// Whether `path` is one of the temp files fetches are written to.
pub fn is_partial_fetch(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| {
            n.starts_with('.') && n.ends_with(PARTIAL_SUFFIX) && n.len() > 1 + PARTIAL_SUFFIX.len()
        })
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}

#[derive(Debug, Default)]
struct GroupOutcome {
    fetched: usize,
    failed: usize,
    pinned: Option<ContentId>,
}

impl<S: ContentStore> Engine<S> {
    /// Fetch every mapped entry that is neither tombstoned nor already present
    /// in the mirror.
    ///
    /// Idempotent: a second pass over unchanged state makes no backend calls.
    /// Entries sharing a content id are fetched one after the other by a
    /// single task, so no id ever has two fetches in flight.
    pub async fn sync(&mut self) -> SyncReport {
        let mut report = SyncReport::default();
        let mirror_root = &self.settings.mirror_root;

        if let Err(e) = tokio::fs::create_dir_all(mirror_root).await {
            tracing::error!(
                mirror = %mirror_root.display(),
                error = %e,
                "Cannot create mirror directory, skipping sync"
            );
            return report;
        }

        let mut groups: BTreeMap<ContentId, Vec<PathKey>> = BTreeMap::new();
        for (key, cid) in self.mapping.iter() {
            if !self.settings.includes(key) {
                report.filtered += 1;
                continue;
            }
            if self.ledger.contains(key) {
                tracing::debug!(path = %key, "Skipping sync, file was deleted from mirror");
                report.tombstoned += 1;
                continue;
            }
            if tokio::fs::symlink_metadata(key.under(mirror_root)).await.is_ok() {
                report.present += 1;
                continue;
            }
            groups.entry(cid.clone()).or_default().push(key.clone());
        }

        let store = &self.store;
        let pinned = &self.pinned;
        let outcomes: Vec<GroupOutcome> = stream::iter(groups)
            .map(|(cid, keys)| {
                let already_pinned = pinned.contains(&cid);
                fetch_group(store, mirror_root, cid, keys, already_pinned)
            })
            .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.fetched += outcome.fetched;
            report.failed += outcome.failed;
            if let Some(cid) = outcome.pinned {
                self.pinned.insert(cid);
            }
        }

        tracing::info!(
            fetched = report.fetched,
            failed = report.failed,
            present = report.present,
            tombstoned = report.tombstoned,
            filtered = report.filtered,
            "Sync pass finished"
        );
        report
    }

    /// Content ids this process has pinned so far.
    pub fn pinned_this_session(&self) -> &HashSet<ContentId> {
        &self.pinned
    }
}

async fn fetch_group<S: ContentStore>(
    store: &S,
    mirror_root: &Path,
    cid: ContentId,
    keys: Vec<PathKey>,
    already_pinned: bool,
) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();
    let mut pinned = already_pinned;

    for key in keys {
        let dest = key.under(mirror_root);
        match fetch_one(store, &cid, &dest).await {
            Ok(()) => {
                outcome.fetched += 1;
                tracing::info!(
                    path = %key,
                    cid = %cid,
                    dest = %dest.display(),
                    "Fetched file into mirror"
                );
            }
            Err(e) => {
                outcome.failed += 1;
                tracing::error!(
                    path = %key,
                    cid = %cid,
                    error = %e,
                    "Failed to fetch file into mirror"
                );
                continue;
            }
        }

        if !pinned {
            match store.pin(&cid).await {
                Ok(()) => {
                    pinned = true;
                    outcome.pinned = Some(cid.clone());
                    tracing::info!(path = %key, cid = %cid, "Pinned synced file");
                }
                Err(e) => {
                    tracing::error!(
                        path = %key,
                        cid = %cid,
                        error = %e,
                        "Failed to pin synced file"
                    )
                }
            }
        }
    }

    outcome
}

/// Fetch into a hidden sibling and rename into place, so `dest` only ever
/// appears complete.
async fn fetch_one<S: ContentStore>(
    store: &S,
    cid: &ContentId,
    dest: &Path,
) -> Result<(), StoreError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let partial = partial_path(dest);
    if let Err(e) = store.get(cid, &partial).await {
        remove_partial(&partial).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&partial, dest).await {
        remove_partial(&partial).await;
        return Err(StoreError::io(dest, e));
    }
    Ok(())
}

async fn remove_partial(partial: &Path) {
    let result = match tokio::fs::symlink_metadata(partial).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(partial).await,
        Ok(_) => tokio::fs::remove_file(partial).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        tracing::warn!(path = %partial.display(), error = %e, "Failed to clean up partial fetch");
    }
}
