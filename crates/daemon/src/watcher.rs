//! Filesystem watcher: turns notify events into engine jobs.
//!
//! Callbacks run on notify's own thread and only enqueue jobs; they never
//! touch the mapping or the ledger.

use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use common::engine::is_partial_fetch;
use common::JobDispatcher;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("failed to create watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoots {
    pub source: PathBuf,
    pub mirror: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Ingest(PathBuf),
    Tombstone(PathBuf),
}

/// Map one notify event to the jobs it should produce.
pub fn classify(event: &Event, roots: &WatchRoots) -> Vec<WatchAction> {
    let mut actions = Vec::new();

    match event.kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            for path in &event.paths {
                push_ingest(&mut actions, path, roots);
            }
        }
        // moved into the tree
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                push_ingest(&mut actions, path, roots);
            }
        }
        // moved out of the tree, e.g. into the trash
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                push_tombstone(&mut actions, path, roots);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to, ..] = event.paths.as_slice() {
                if !to.starts_with(&roots.mirror) {
                    push_tombstone(&mut actions, from, roots);
                }
                push_ingest(&mut actions, to, roots);
            }
        }
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            for path in &event.paths {
                push_tombstone(&mut actions, path, roots);
            }
        }
        _ => {}
    }

    actions
}

fn push_tombstone(actions: &mut Vec<WatchAction>, path: &Path, roots: &WatchRoots) {
    if is_partial_fetch(path) {
        return;
    }
    if path.starts_with(&roots.mirror) && path != roots.mirror {
        actions.push(WatchAction::Tombstone(path.to_path_buf()));
    } else if !path.starts_with(&roots.source) {
        tracing::debug!(path = %path.display(), "Ignoring removal outside watched roots");
    }
}

fn push_ingest(actions: &mut Vec<WatchAction>, path: &Path, roots: &WatchRoots) {
    if is_partial_fetch(path) || !path.starts_with(&roots.source) || path == roots.source {
        if !path.starts_with(&roots.mirror) {
            tracing::debug!(path = %path.display(), "Ignoring event outside source directory");
        }
        return;
    }
    // CreateKind::Any carries no file/folder hint, so ask the filesystem
    if path.is_dir() {
        return;
    }
    actions.push(WatchAction::Ingest(path.to_path_buf()));
}

/// Recursive watches on the source and mirror roots. Dropping it stops both.
pub struct SyncWatcher {
    _watcher: RecommendedWatcher,
}

impl SyncWatcher {
    pub fn start(roots: WatchRoots, dispatcher: JobDispatcher) -> Result<Self, WatcherError> {
        let handler_roots = roots.clone();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for action in classify(&event, &handler_roots) {
                    let sent = match action {
                        WatchAction::Ingest(path) => {
                            tracing::info!(path = %path.display(), "New file detected");
                            dispatcher.dispatch_ingest(path)
                        }
                        WatchAction::Tombstone(path) => {
                            tracing::info!(path = %path.display(), "File deleted from mirror");
                            dispatcher.dispatch_tombstone(path)
                        }
                    };
                    if let Err(e) = sent {
                        tracing::debug!(error = %e, "Dropping watcher event, worker stopped");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Watch error"),
        })
        .map_err(WatcherError::Create)?;

        for path in [&roots.source, &roots.mirror] {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|source| WatcherError::Watch {
                    path: path.clone(),
                    source,
                })?;
            tracing::info!(path = %path.display(), "Watching directory");
        }

        Ok(Self { _watcher: watcher })
    }
}
