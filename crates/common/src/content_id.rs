use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ContentIdError {
    #[error("content id is empty")]
    Empty,
    #[error("content id contains whitespace: {0:?}")]
    Whitespace(String),
}

/// Opaque identifier issued by the content store for a blob.
///
/// The engine never interprets it beyond equality; it is whatever the
/// backend printed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContentIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ContentIdError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(ContentIdError::Whitespace(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContentId {
    type Error = ContentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContentId> for String {
    fn from(cid: ContentId) -> Self {
        cid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_validation() {
        assert!(ContentId::new("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG").is_ok());
        assert_eq!(ContentId::new(""), Err(ContentIdError::Empty));
        assert!(matches!(
            ContentId::new("Qm abc"),
            Err(ContentIdError::Whitespace(_))
        ));
    }
}
