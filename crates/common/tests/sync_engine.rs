//! End-to-end behavior of the engine driven through the job queue

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use common::store::MemoryContentStore;
use common::{
    run_worker, ContentId, Engine, JobDispatcher, LedgerStore, Mapping, MappingStore, PathKey,
    SyncSettings,
};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    store: MemoryContentStore,
}

impl Harness {
    fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("Upload"))?;
        std::fs::create_dir_all(dir.path().join("Synced_dir"))?;
        Ok(Self {
            dir,
            store: MemoryContentStore::new(),
        })
    }

    fn source(&self) -> PathBuf {
        self.dir.path().join("Upload")
    }

    fn mirror(&self) -> PathBuf {
        self.dir.path().join("Synced_dir")
    }

    fn mappings(&self) -> MappingStore {
        let data = self.dir.path().join("data");
        MappingStore::new(data.join("file_cid_mapping.json"), data.join("backups"))
    }

    fn ledger(&self) -> LedgerStore {
        LedgerStore::new(self.dir.path().join("data").join("deleted_files.json"))
    }

    fn engine(&self) -> Engine<MemoryContentStore> {
        let mut settings = SyncSettings::new(self.source(), self.mirror());
        settings.settle_delay = Duration::ZERO;
        Engine::new(settings, self.store.clone(), self.mappings(), self.ledger())
    }

    fn write_source(&self, rel: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.source().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(path)
    }
}

fn key(s: &str) -> PathKey {
    PathKey::parse(s).unwrap()
}

fn cid(s: &str) -> ContentId {
    ContentId::new(s).unwrap()
}

#[tokio::test]
async fn test_convergence_fetches_mapped_entry() -> Result<()> {
    let h = Harness::new()?;
    h.store.insert_blob(&cid("CID1"), b"alpha".to_vec());
    let mapping: Mapping = [(key("a.txt"), cid("CID1"))].into_iter().collect();
    h.mappings().save(&mapping)?;

    let mut engine = h.engine();
    engine.sync().await;

    assert_eq!(std::fs::read(h.mirror().join("a.txt"))?, b"alpha");
    let gets = h.store.get_calls();
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].0, cid("CID1"));
    Ok(())
}

#[tokio::test]
async fn test_suppression_by_tombstone() -> Result<()> {
    let h = Harness::new()?;
    h.store.insert_blob(&cid("CID1"), b"alpha".to_vec());
    let mapping: Mapping = [(key("a.txt"), cid("CID1"))].into_iter().collect();
    h.mappings().save(&mapping)?;
    let mut ledger = h.ledger().load();
    h.ledger().append(&mut ledger, key("a.txt"))?;

    let mut engine = h.engine();
    engine.sync().await;

    assert!(h.store.get_calls().is_empty());
    assert!(!h.mirror().join("a.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_deleted_mirror_file_is_never_resurrected() -> Result<()> {
    let h = Harness::new()?;
    let path = h.write_source("docs/a.txt", b"alpha")?;
    let (dispatcher, receiver) = JobDispatcher::new();
    let worker = tokio::spawn(run_worker(h.engine(), receiver));

    dispatcher.dispatch_ingest(&path)?;
    dispatcher.snapshot().await?;
    let mirrored = h.mirror().join("docs").join("a.txt");
    assert!(mirrored.exists());

    std::fs::remove_file(&mirrored)?;
    dispatcher.dispatch_tombstone(&mirrored)?;
    // a re-ingest of the same source path must not bring it back either
    dispatcher.dispatch_ingest(&path)?;
    dispatcher.dispatch_sync()?;
    dispatcher.dispatch_sync()?;
    let snapshot = dispatcher.snapshot().await?;

    assert!(snapshot.ledger.contains(&key("docs/a.txt")));
    assert!(!mirrored.exists());

    drop(dispatcher);
    worker.await?;
    assert!(h.ledger().load().contains(&key("docs/a.txt")));
    Ok(())
}

#[tokio::test]
async fn test_ingestion_of_scripted_file() -> Result<()> {
    let h = Harness::new()?;
    let path = h.write_source("notes.txt", b"notes")?;
    h.store.script_add(&path, vec![("notes.txt", "CID9")]);

    let mut engine = h.engine();
    engine.ingest(&path).await?;

    assert_eq!(engine.mapping().get(&key("notes.txt")), Some(&cid("CID9")));
    assert_eq!(h.store.pin_calls(), vec![cid("CID9")]);
    assert_eq!(h.mappings().load().get(&key("notes.txt")), Some(&cid("CID9")));
    // the sync ran and used the fresh mapping
    assert_eq!(h.store.get_calls().len(), 1);
    assert!(h.mirror().join("notes.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingestions_lose_no_update() -> Result<()> {
    let h = Harness::new()?;
    let mut paths = Vec::new();
    for i in 0..16 {
        let body = format!("body {i}");
        paths.push(h.write_source(&format!("batch/file_{i:02}.txt"), body.as_bytes())?);
    }

    let (dispatcher, receiver) = JobDispatcher::new();
    let worker = tokio::spawn(run_worker(h.engine(), receiver));

    let mut producers = Vec::new();
    for path in paths {
        let dispatcher = dispatcher.clone();
        producers.push(tokio::spawn(async move {
            dispatcher.dispatch_ingest(path)?;
            dispatcher.dispatch_sync()
        }));
    }
    for producer in producers {
        producer.await??;
    }

    let snapshot = dispatcher.snapshot().await?;
    assert_eq!(snapshot.mapping.len(), 16);

    drop(dispatcher);
    worker.await?;

    let persisted = h.mappings().load();
    assert_eq!(persisted.len(), 16);
    for i in 0..16 {
        assert!(persisted.contains(&key(&format!("batch/file_{i:02}.txt"))));
    }
    Ok(())
}

#[tokio::test]
async fn test_startup_scan_then_idempotent_sync() -> Result<()> {
    let h = Harness::new()?;
    h.write_source("a.txt", b"alpha")?;
    h.write_source("nested/b.txt", b"beta")?;
    h.write_source("nested/c.txt", b"beta")?;

    let mut engine = h.engine();
    let report = engine.startup_scan().await;
    assert_eq!(report.ingested, 3);
    assert_eq!(report.sync.fetched, 3);
    assert_eq!(h.store.max_in_flight_per_cid(), 1);

    let gets = h.store.get_calls().len();
    let pins = h.store.pin_calls().len();
    let again = engine.sync().await;
    assert_eq!(again.fetched, 0);
    assert_eq!(h.store.get_calls().len(), gets);
    assert_eq!(h.store.pin_calls().len(), pins);
    Ok(())
}

#[tokio::test]
async fn test_state_survives_restart() -> Result<()> {
    let h = Harness::new()?;
    let path = h.write_source("a.txt", b"alpha")?;
    {
        let mut engine = h.engine();
        engine.ingest(&path).await?;
        engine.tombstone(&h.mirror().join("a.txt"))?;
    }

    let engine = h.engine();
    assert!(engine.mapping().contains(&key("a.txt")));
    assert!(engine.ledger().contains(&key("a.txt")));
    Ok(())
}
