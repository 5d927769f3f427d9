//! Pin audit: cross-reference the mapping with what the backend has pinned.

use std::collections::HashMap;
use std::path::Path;

use super::Engine;
use crate::content_id::ContentId;
use crate::path_key::PathKey;
use crate::state::{DeletionLedger, Mapping};
use crate::store::{ContentStore, StoreError};

pub const UNKNOWN_PIN_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub key: PathKey,
    pub cid: ContentId,
    /// Pin type reported by the backend, `None` when the id is not pinned
    pub pin_type: Option<String>,
    pub mirrored: bool,
    pub tombstoned: bool,
}

impl AuditEntry {
    pub fn pin_label(&self) -> &str {
        self.pin_type.as_deref().unwrap_or(UNKNOWN_PIN_TYPE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audit {
    pub entries: Vec<AuditEntry>,
}

impl Audit {
    pub fn build(
        mapping: &Mapping,
        ledger: &DeletionLedger,
        mirror_root: &Path,
        pins: &HashMap<ContentId, String>,
    ) -> Self {
        let entries = mapping
            .iter()
            .map(|(key, cid)| AuditEntry {
                key: key.clone(),
                cid: cid.clone(),
                pin_type: pins.get(cid).cloned(),
                mirrored: key.under(mirror_root).exists(),
                tombstoned: ledger.contains(key),
            })
            .collect();
        Self { entries }
    }

    pub fn unpinned(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|e| e.pin_type.is_none())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: ContentStore> Engine<S> {
    /// List pinned content and log the pin status of every mapped path.
    /// Purely informational; nothing is corrected here.
    pub async fn audit(&self) -> Result<Audit, StoreError> {
        let pins = self.store.pinned().await?;
        let audit = Audit::build(&self.mapping, &self.ledger, &self.settings.mirror_root, &pins);

        for entry in &audit.entries {
            tracing::info!(
                path = %entry.key,
                cid = %entry.cid,
                pin = entry.pin_label(),
                mirrored = entry.mirrored,
                tombstoned = entry.tombstoned,
                "Pin status"
            );
        }
        tracing::info!(
            mapped = audit.len(),
            pinned = pins.len(),
            unpinned = audit.unpinned().count(),
            "Pin audit finished"
        );

        Ok(audit)
    }
}
