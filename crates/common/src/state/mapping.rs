use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{read_json, write_atomic, StateError};
use crate::content_id::ContentId;
use crate::path_key::PathKey;

const BACKUP_PREFIX: &str = "file_cid_mapping_";
const BACKUP_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S%.3f";

/// Path → content id associations, kept sorted so snapshots diff cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Mapping(BTreeMap<PathKey, ContentId>);

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PathKey) -> Option<&ContentId> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.0.contains_key(key)
    }

    /// Set the content id for `key`, returning the previous one.
    pub fn insert(&mut self, key: PathKey, cid: ContentId) -> Option<ContentId> {
        self.0.insert(key, cid)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, PathKey, ContentId> {
        self.0.iter()
    }

    /// Rewrite keys that still carry the source directory's name as their
    /// first component. When the root-relative key is already mapped, that
    /// entry wins and the prefixed one is dropped. Returns how many keys
    /// were rewritten or dropped.
    pub fn strip_root_prefix(&mut self, root: &str) -> usize {
        let prefixed: Vec<PathKey> = self
            .0
            .keys()
            .filter(|key| key.strip_root(root).is_some())
            .cloned()
            .collect();

        for key in &prefixed {
            let Some(cid) = self.0.remove(key) else {
                continue;
            };
            if let Some(stripped) = key.strip_root(root) {
                self.0.entry(stripped).or_insert(cid);
            }
        }
        prefixed.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(PathKey, ContentId)> for Mapping {
    fn from_iter<T: IntoIterator<Item = (PathKey, ContentId)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Mapping {
    type Item = (&'a PathKey, &'a ContentId);
    type IntoIter = btree_map::Iter<'a, PathKey, ContentId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// On-disk home of the [`Mapping`], versioned through timestamped backups.
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
    backups_dir: PathBuf,
}

impl MappingStore {
    pub fn new(path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Load the snapshot. Never fails: a missing or corrupt file yields an
    /// empty mapping, and individual entries that do not validate are dropped.
    pub fn load(&self) -> Mapping {
        let Some(raw) = read_json::<BTreeMap<String, String>>(&self.path, "file/cid mapping")
        else {
            return Mapping::new();
        };

        let mut mapping = Mapping::new();
        for (key, cid) in raw {
            match (PathKey::parse(&key), ContentId::new(cid)) {
                (Ok(key), Ok(cid)) => {
                    mapping.insert(key, cid);
                }
                (Err(e), _) => {
                    tracing::warn!(key = %key, error = %e, "Dropping mapping entry with bad path")
                }
                (_, Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Dropping mapping entry with bad cid")
                }
            }
        }

        tracing::debug!(entries = mapping.len(), path = %self.path.display(), "Loaded mapping");
        mapping
    }

    /// Back up the current snapshot (if any), then atomically replace it.
    ///
    /// Returns the path of the backup that was written.
    pub fn save(&self, mapping: &Mapping) -> Result<Option<PathBuf>, StateError> {
        let backup = self.backup()?;

        let encoded = serde_json::to_vec_pretty(mapping).map_err(|source| StateError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &encoded)?;

        tracing::info!(
            entries = mapping.len(),
            path = %self.path.display(),
            "Saved file/cid mapping"
        );
        Ok(backup)
    }

    fn backup(&self) -> Result<Option<PathBuf>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }

        fs::create_dir_all(&self.backups_dir).map_err(|e| StateError::io(&self.backups_dir, e))?;

        let target = self.next_backup_path();
        fs::copy(&self.path, &target).map_err(|e| StateError::io(&target, e))?;

        tracing::info!(backup = %target.display(), "Backed up file/cid mapping");
        Ok(Some(target))
    }

    fn next_backup_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format(BACKUP_TIMESTAMP).to_string();
        let mut candidate = self
            .backups_dir
            .join(format!("{}{}.json", BACKUP_PREFIX, stamp));
        let mut n = 1;
        while candidate.exists() {
            candidate = self
                .backups_dir
                .join(format!("{}{}_{}.json", BACKUP_PREFIX, stamp, n));
            n += 1;
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PathKey {
        PathKey::parse(s).unwrap()
    }

    fn cid(s: &str) -> ContentId {
        ContentId::new(s).unwrap()
    }

    fn store(dir: &Path) -> MappingStore {
        MappingStore::new(
            dir.join("data").join("file_cid_mapping.json"),
            dir.join("data").join("backups"),
        )
    }

    fn backups(store: &MappingStore) -> Vec<PathBuf> {
        match fs::read_dir(store.backups_dir()) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load().is_empty());
    }

    #[test]
    fn test_load_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();

        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mapping: Mapping = [
            (key("a.txt"), cid("CID1")),
            (key("docs/b.txt"), cid("CID2")),
        ]
        .into_iter()
        .collect();

        store.save(&mapping).unwrap();
        assert_eq!(store.load(), mapping);
    }

    #[test]
    fn test_first_save_creates_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let backup = store.save(&Mapping::new()).unwrap();
        assert!(backup.is_none());
        assert!(backups(&store).is_empty());
    }

    #[test]
    fn test_save_backs_up_previous_bytes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        // hand-written snapshot with unusual formatting must be preserved as-is
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let previous = b"{\"a.txt\":   \"CID1\"}\n".to_vec();
        fs::write(store.path(), &previous).unwrap();

        let mut mapping = store.load();
        mapping.insert(key("b.txt"), cid("CID2"));
        let backup = store.save(&mapping).unwrap().unwrap();

        assert_eq!(backups(&store), vec![backup.clone()]);
        assert_eq!(fs::read(&backup).unwrap(), previous);
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(BACKUP_PREFIX));
    }

    #[test]
    fn test_each_save_adds_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut mapping = Mapping::new();
        for i in 0..4 {
            mapping.insert(key(&format!("f{}.txt", i)), cid(&format!("CID{}", i)));
            store.save(&mapping).unwrap();
        }

        // the first save had nothing to back up
        assert_eq!(backups(&store).len(), 3);
    }

    #[test]
    fn test_strip_root_prefix_rewrites_legacy_keys() {
        let mut mapping: Mapping = [
            (key("Upload/a.txt"), cid("CID1")),
            (key("Upload/docs/b.txt"), cid("CID2")),
            (key("Upload/c.txt"), cid("OLD")),
            (key("c.txt"), cid("CID3")),
            (key("Uploads/d.txt"), cid("CID4")),
        ]
        .into_iter()
        .collect();

        assert_eq!(mapping.strip_root_prefix("Upload"), 3);
        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping.get(&key("a.txt")), Some(&cid("CID1")));
        assert_eq!(mapping.get(&key("docs/b.txt")), Some(&cid("CID2")));
        assert_eq!(mapping.get(&key("c.txt")), Some(&cid("CID3")));
        assert_eq!(mapping.get(&key("Uploads/d.txt")), Some(&cid("CID4")));

        assert_eq!(mapping.strip_root_prefix("Upload"), 0);
    }

    #[test]
    fn test_load_drops_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            br#"{"ok.txt": "CID1", "../escape.txt": "CID2", "blank.txt": ""}"#,
        )
        .unwrap();

        let mapping = store.load();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(&key("ok.txt")), Some(&cid("CID1")));
    }
}
