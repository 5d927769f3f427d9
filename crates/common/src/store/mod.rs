//! Connector to the content-addressed storage backend.
//!
//! The engine only talks to the backend through [`ContentStore`]. Two
//! implementations ship with the crate:
//!
//! - [`KuboStore`]: drives a Kubo (IPFS) node through its CLI binary, with a
//!   per-call timeout and bounded retries
//! - `MemoryContentStore`: in-process store for tests (`test-utils` feature)

pub mod kubo;
#[cfg(feature = "test-utils")]
pub mod memory;
mod retry;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::content_id::ContentId;

pub use kubo::{KuboConfig, KuboStore};
#[cfg(feature = "test-utils")]
pub use memory::MemoryContentStore;
pub use retry::RetryPolicy;

/// One entry reported by [`ContentStore::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedEntry {
    /// Name relative to the parent directory of the added path, e.g.
    /// `notes.txt` for a file or `dir/a.txt` for a leaf of a directory.
    pub name: String,
    pub cid: ContentId,
}

/// Value for [`ContentStore::config_set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    String(String),
    Bool(bool),
    /// Raw JSON, e.g. `30` or `["a", "b"]`.
    Json(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => f.write_str(s),
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Json(j) => f.write_str(j),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to launch `{op}`: {source}")]
    Spawn {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("`{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("`{op}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        op: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unexpected output from `{op}`: {detail}")]
    MalformedOutput { op: &'static str, detail: String },
    #[error("content {0} not found")]
    NotFound(ContentId),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Transient failures worth another attempt. A backend that ran and said
    /// no will say no again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Spawn { .. } | StoreError::Timeout { .. })
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync + fmt::Debug + 'static {
    /// Recursively add `path`, returning one entry per addressed item.
    async fn add(&self, path: &Path) -> Result<Vec<AddedEntry>, StoreError>;

    /// Pin `cid`. Pinning an already pinned id succeeds.
    async fn pin(&self, cid: &ContentId) -> Result<(), StoreError>;

    /// Fetch `cid` into the file at `dest`. The parent directory exists.
    async fn get(&self, cid: &ContentId, dest: &Path) -> Result<(), StoreError>;

    /// Identity of the local node.
    async fn id(&self) -> Result<String, StoreError>;

    /// Currently connected peers.
    async fn peers(&self) -> Result<Vec<String>, StoreError>;

    /// Ask the routing layer for the addresses of `peer`.
    async fn find_peers(&self, peer: &str) -> Result<Vec<String>, StoreError>;

    async fn config_set(&self, key: &str, value: &ConfigValue) -> Result<(), StoreError>;

    /// Every pinned content id together with its pin type.
    async fn pinned(&self) -> Result<HashMap<ContentId, String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let spawn = StoreError::Spawn {
            op: "add",
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no binary"),
        };
        let timeout = StoreError::Timeout {
            op: "get",
            after: Duration::from_secs(1),
        };
        let failed = StoreError::CommandFailed {
            op: "pin",
            code: Some(1),
            stderr: "invalid path".into(),
        };
        let malformed = StoreError::MalformedOutput {
            op: "id",
            detail: "empty".into(),
        };

        assert!(spawn.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!failed.is_retryable());
        assert!(!malformed.is_retryable());
    }

    #[test]
    fn test_config_value_display() {
        assert_eq!(ConfigValue::String("dhtclient".into()).to_string(), "dhtclient");
        assert_eq!(ConfigValue::Bool(true).to_string(), "true");
        assert_eq!(ConfigValue::Json("30".into()).to_string(), "30");
    }
}
