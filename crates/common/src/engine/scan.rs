//! Startup scan: drain files that arrived while the daemon was not running.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::ingest::Recorded;
use super::{Engine, SyncReport};
use crate::content_id::ContentId;
use crate::path_key::PathKey;
use crate::store::ContentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Files found under the source root
    pub discovered: usize,
    /// Files skipped because their key is already mapped
    pub already_mapped: usize,
    pub ingested: usize,
    pub failed: usize,
    pub consumed: usize,
    /// The single reconciliation pass run after the scan
    pub sync: SyncReport,
}

impl<S: ContentStore> Engine<S> {
    /// Ingest every unmapped file under the source root, then sync once.
    ///
    /// When `consume_source` is set, files that are still present are
    /// ingested again even if their key is mapped: a consumed file that is
    /// still on disk was either never deleted or has been re-created.
    pub async fn startup_scan(&mut self) -> ScanReport {
        let mut report = ScanReport::default();
        let files = list_files(self.settings.source_root.clone()).await;
        report.discovered = files.len();
        tracing::info!(files = files.len(), "Scanning source directory");

        let mut recorded: Vec<(PathBuf, Vec<(PathKey, ContentId)>)> = Vec::new();
        for path in files {
            let Ok(key) = PathKey::within(&self.settings.source_root, &path) else {
                continue;
            };
            if self.mapping.contains(&key) && !self.settings.consume_source {
                report.already_mapped += 1;
                continue;
            }

            match self.record(&path).await {
                Ok(Recorded::Entries(entries)) => {
                    report.ingested += 1;
                    recorded.push((path, entries));
                }
                Ok(Recorded::Dropped(reason)) => {
                    tracing::debug!(path = %key, ?reason, "Skipped during scan")
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(path = %key, error = %e, "Failed to ingest file during scan");
                }
            }
        }

        report.sync = self.sync().await;

        for (path, entries) in &recorded {
            if self.consume(path, entries).await {
                report.consumed += 1;
            }
        }

        tracing::info!(
            discovered = report.discovered,
            ingested = report.ingested,
            already_mapped = report.already_mapped,
            failed = report.failed,
            "Startup scan finished"
        );
        report
    }
}

async fn list_files(root: PathBuf) -> Vec<PathBuf> {
    let walk_root = root.clone();
    match tokio::task::spawn_blocking(move || walk(&walk_root)).await {
        Ok(files) => files,
        Err(e) => {
            tracing::error!(root = %root.display(), error = %e, "Source directory walk failed");
            Vec::new()
        }
    }
}

fn walk(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry in source directory");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}
