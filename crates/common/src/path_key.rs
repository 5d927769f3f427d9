//! Normalized relative paths used as the join key between the source and
//! mirror namespaces.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PathKeyError {
    #[error("path key is empty")]
    Empty,
    #[error("path key must be relative: {0}")]
    Absolute(String),
    #[error("path key may not contain '.' or '..' components: {0}")]
    Traversal(String),
    #[error("path key is not valid utf-8: {0}")]
    NotUtf8(String),
    #[error("{path} is not under {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// A validated, `/`-separated path relative to a sync root.
///
/// Keys are built once from a filesystem path and carried through; mirror and
/// source locations are always derived with [`PathKey::under`], never by
/// string surgery on absolute paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathKey(String);

impl PathKey {
    /// Parse a key from its string form. Backslashes are accepted as
    /// separators so keys written on Windows still load.
    pub fn parse(raw: &str) -> Result<Self, PathKeyError> {
        let unified = raw.replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(PathKeyError::Absolute(raw.to_string()));
        }

        let mut parts = Vec::new();
        for part in unified.split('/') {
            match part {
                "" => continue,
                "." | ".." => return Err(PathKeyError::Traversal(raw.to_string())),
                part => parts.push(part),
            }
        }

        if parts.is_empty() {
            return Err(PathKeyError::Empty);
        }

        Ok(Self(parts.join("/")))
    }

    /// Build a key from a relative filesystem path.
    pub fn from_relative(path: &Path) -> Result<Self, PathKeyError> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| PathKeyError::NotUtf8(path.display().to_string()))?;
                    parts.push(part);
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    return Err(PathKeyError::Traversal(path.display().to_string()))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathKeyError::Absolute(path.display().to_string()))
                }
            }
        }

        if parts.is_empty() {
            return Err(PathKeyError::Empty);
        }

        Ok(Self(parts.join("/")))
    }

    /// Build the key of `path` relative to `root`. Fails when `path` does not
    /// lie strictly under `root`.
    pub fn within(root: &Path, path: &Path) -> Result<Self, PathKeyError> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| PathKeyError::OutsideRoot {
                path: path.to_path_buf(),
                root: root.to_path_buf(),
            })?;
        Self::from_relative(relative)
    }

    /// Join a relative name (as reported by the content store) onto this key.
    pub fn join(&self, name: &str) -> Result<Self, PathKeyError> {
        Self::parse(&format!("{}/{}", self.0, name))
    }

    /// Location of this key under `root`.
    pub fn under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in self.0.split('/') {
            path.push(part);
        }
        path
    }

    /// Drop a leading `root` component. Keys recorded against the source
    /// directory itself (`Upload/a.txt`) become root-relative (`a.txt`).
    /// Returns `None` when the key does not start with `root` or is `root`
    /// itself.
    pub fn strip_root(&self, root: &str) -> Option<Self> {
        self.0
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| Self(rest.to_string()))
    }

    /// The parent key, or `None` for a top-level entry.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_string()))
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some(("", _)) | None => None,
            Some((_, ext)) => Some(ext),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PathKey {
    type Error = PathKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PathKey> for String {
    fn from(key: PathKey) -> Self {
        key.0
    }
}

impl AsRef<str> for PathKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
