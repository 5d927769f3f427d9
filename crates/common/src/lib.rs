//! Core of mirrorsync: keeps a mirror directory consistent with a source
//! directory by round-tripping every file through a content-addressed store.
//!
//! # Architecture
//!
//! - [`state`]: the persisted path → content id mapping and the deletion ledger
//! - [`store`]: the `ContentStore` connector trait plus Kubo and in-memory backends
//! - [`engine`]: ingestion, reconciliation, audit and the startup scan
//! - [`jobs`] / [`worker`]: the queue through which every mutation is serialized
//!
//! The [`engine::Engine`] is owned by exactly one worker task. Watchers and
//! timers never touch it directly; they send [`jobs::Job`]s.

pub mod content_id;
pub mod engine;
pub mod jobs;
pub mod path_key;
pub mod state;
pub mod store;
pub mod worker;

/// Version of the core crate, reported by `mirrorsync version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use content_id::{ContentId, ContentIdError};
pub use engine::{
    Audit, AuditEntry, DropReason, Engine, IngestError, IngestOutcome, IngestReport, ScanReport,
    SyncReport, SyncSettings,
};
pub use jobs::{Job, JobDispatcher, JobReceiver, PeriodicClaim, Snapshot};
pub use path_key::{PathKey, PathKeyError};
pub use state::{DeletionLedger, LedgerStore, Mapping, MappingStore, StateError};
pub use store::{AddedEntry, ConfigValue, ContentStore, StoreError};
pub use worker::run_worker;
