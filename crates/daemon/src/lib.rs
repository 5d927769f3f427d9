//! Daemon side of mirrorsync: configuration, logging, backend bootstrap,
//! the filesystem watcher and the long-running service loop.

pub mod backend;
pub mod logging;
pub mod network;
pub mod process;
pub mod state;
pub mod watcher;

pub use backend::{bootstrap, BootstrapError};
pub use process::{spawn_service, ShutdownHandle};
pub use state::{AppConfig, AppState, BackendConfig, StateError};
pub use watcher::{SyncWatcher, WatcherError};
