//! Persisted engine state: the path → content id mapping and the deletion
//! ledger.
//!
//! Both files are plain JSON so they can be inspected and hand-edited. Loads
//! fail open: a missing or unreadable file yields an empty structure and a log
//! line, never an error. Writes go through [`write_atomic`], so a crash leaves
//! either the old or the new file on disk, never a truncated one.

mod ledger;
mod mapping;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub use ledger::{DeletionLedger, LedgerStore};
pub use mapping::{Mapping, MappingStore};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

impl StateError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replace `path` with `content` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StateError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StateError::io(parent, e))?;
    temp.write_all(content).map_err(|e| StateError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StateError::io(temp.path(), e))?;
    temp.persist(path).map_err(|source| StateError::Persist {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Read a JSON state file, distinguishing "absent" from "broken".
///
/// Returns `None` when the file does not exist or cannot be decoded; the
/// caller substitutes an empty structure.
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No {} on disk yet, starting empty", what);
            return None;
        }
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to read {}, starting empty",
                what
            );
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Corrupt {}, starting empty", what);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // no temp files left next to the target
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
    }
}
