//! On-disk application state: the home directory layout and `config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::state::{LedgerStore, MappingStore};
use common::store::{KuboConfig, RetryPolicy};
use common::SyncSettings;

pub const APP_NAME: &str = "mirrorsync";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATA_DIR_NAME: &str = "data";
pub const MAPPING_FILE_NAME: &str = "file_cid_mapping.json";
pub const LEDGER_FILE_NAME: &str = "deleted_files.json";
pub const BACKUPS_DIR_NAME: &str = "backups";
pub const LOGS_DIR_NAME: &str = "logs";
pub const DEFAULT_SOURCE_DIR_NAME: &str = "Upload";
pub const DEFAULT_MIRROR_DIR_NAME: &str = "Synced_dir";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot determine home directory")]
    NoHomeDir,
    #[error("{0} is already initialized")]
    AlreadyInitialized(PathBuf),
    #[error("{0} is not initialized, run `mirrorsync init` first")]
    NotInitialized(PathBuf),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode config: {0}")]
    EncodeConfig(#[from] toml::ser::Error),
}

impl StateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How the daemon reaches and prepares the Kubo node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `ipfs` executable, looked up on `PATH` when not absolute
    pub binary: PathBuf,
    /// Kubo repository; `~/.ipfs` when unset
    pub repo_path: Option<PathBuf>,
    pub command_timeout_secs: u64,
    /// Timeout of the startup liveness probe
    pub liveness_timeout_secs: u64,
    /// Start `ipfs daemon` when the probe fails
    pub spawn_daemon: bool,
    /// Wait after spawning the daemon before probing again
    pub startup_grace_secs: u64,
    /// Drop `swarm.key` and enable DHT client routing and mDNS
    pub public_network: bool,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ipfs"),
            repo_path: None,
            command_timeout_secs: 120,
            liveness_timeout_secs: 30,
            spawn_daemon: true,
            startup_grace_secs: 10,
            public_network: true,
            retry_attempts: 3,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl BackendConfig {
    pub fn kubo_config(&self) -> KuboConfig {
        KuboConfig {
            binary: self.binary.clone(),
            repo_path: self.repo_path.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }
}

/// Contents of `config.toml`. Every field has a default, so a partial file
/// is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name used for the log file
    pub node_name: String,
    /// Watched source directory; relative paths resolve against the home
    pub source_dir: PathBuf,
    /// Mirror directory; relative paths resolve against the home
    pub mirror_dir: PathBuf,
    /// Delete source files after they have been mirrored
    pub consume_source: bool,
    /// Only mirror these extensions; empty mirrors everything
    pub include_extensions: Vec<String>,
    pub sync_interval_secs: u64,
    pub peer_monitor_interval_secs: u64,
    pub settle_delay_ms: u64,
    pub max_concurrent_fetches: usize,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub backend: BackendConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: "local".to_string(),
            source_dir: PathBuf::from(DEFAULT_SOURCE_DIR_NAME),
            mirror_dir: PathBuf::from(DEFAULT_MIRROR_DIR_NAME),
            consume_source: false,
            include_extensions: Vec::new(),
            sync_interval_secs: 60,
            peer_monitor_interval_secs: 30,
            settle_delay_ms: 250,
            max_concurrent_fetches: 4,
            log_level: "info".to_string(),
            backend: BackendConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn peer_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.peer_monitor_interval_secs.max(1))
    }
}

/// Resolved locations of everything mirrorsync keeps on disk.
#[derive(Debug, Clone)]
pub struct AppState {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub mapping_path: PathBuf,
    pub ledger_path: PathBuf,
    pub backups_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub source_dir: PathBuf,
    pub mirror_dir: PathBuf,
    pub config: AppConfig,
}

impl AppState {
    /// The home directory: `config_path` if given, `~/.mirrorsync` otherwise.
    pub fn home_dir(config_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        match config_path {
            Some(path) => Ok(path),
            None => dirs::home_dir()
                .map(|home| home.join(format!(".{}", APP_NAME)))
                .ok_or(StateError::NoHomeDir),
        }
    }

    /// Write `config.toml` into a fresh home and create the directory layout.
    pub fn init(
        config_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let home = Self::home_dir(config_path)?;
        let config_file = home.join(CONFIG_FILE_NAME);
        if config_file.exists() {
            return Err(StateError::AlreadyInitialized(home));
        }

        std::fs::create_dir_all(&home).map_err(|e| StateError::io(&home, e))?;
        let config = config.unwrap_or_default();
        let encoded = toml::to_string_pretty(&config)?;
        std::fs::write(&config_file, encoded).map_err(|e| StateError::io(&config_file, e))?;

        let state = Self::resolve(home, config);
        state.ensure_dirs()
    }

    /// Load an initialized home.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, StateError> {
        let home = Self::home_dir(config_path)?;
        let config_file = home.join(CONFIG_FILE_NAME);
        if !config_file.exists() {
            return Err(StateError::NotInitialized(home));
        }

        let raw = std::fs::read_to_string(&config_file)
            .map_err(|e| StateError::io(&config_file, e))?;
        let config: AppConfig = toml::from_str(&raw).map_err(|source| StateError::ParseConfig {
            path: config_file.clone(),
            source,
        })?;
        Ok(Self::resolve(home, config))
    }

    /// Load the home, initializing it with defaults on first run.
    pub fn load_or_init(config_path: Option<PathBuf>) -> Result<Self, StateError> {
        let home = Self::home_dir(config_path)?;
        if home.join(CONFIG_FILE_NAME).exists() {
            Self::load(Some(home))
        } else {
            Self::init(Some(home), None)
        }
    }

    fn resolve(home: PathBuf, config: AppConfig) -> Self {
        let data_dir = home.join(DATA_DIR_NAME);
        Self {
            config_path: home.join(CONFIG_FILE_NAME),
            mapping_path: data_dir.join(MAPPING_FILE_NAME),
            ledger_path: data_dir.join(LEDGER_FILE_NAME),
            backups_dir: data_dir.join(BACKUPS_DIR_NAME),
            logs_dir: data_dir.join(LOGS_DIR_NAME),
            source_dir: home.join(&config.source_dir),
            mirror_dir: home.join(&config.mirror_dir),
            data_dir,
            home,
            config,
        }
    }

    /// Create every directory the daemon writes to. The source and mirror
    /// paths are canonicalized afterwards so watcher events, which carry
    /// canonical paths, strip cleanly against them.
    pub fn ensure_dirs(mut self) -> Result<Self, StateError> {
        for dir in [
            &self.data_dir,
            &self.backups_dir,
            &self.logs_dir,
            &self.source_dir,
            &self.mirror_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;
        }

        self.source_dir = self
            .source_dir
            .canonicalize()
            .map_err(|e| StateError::io(&self.source_dir, e))?;
        self.mirror_dir = self
            .mirror_dir
            .canonicalize()
            .map_err(|e| StateError::io(&self.mirror_dir, e))?;
        Ok(self)
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir
            .join(format!("log_{}.log", self.config.node_name))
    }

    pub fn mapping_store(&self) -> MappingStore {
        MappingStore::new(&self.mapping_path, &self.backups_dir)
    }

    pub fn ledger_store(&self) -> LedgerStore {
        LedgerStore::new(&self.ledger_path)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        let mut settings = SyncSettings::new(&self.source_dir, &self.mirror_dir);
        settings.consume_source = self.config.consume_source;
        settings.include_extensions = self.config.include_extensions.clone();
        settings.settle_delay = Duration::from_millis(self.config.settle_delay_ms);
        settings.max_concurrent_fetches = self.config.max_concurrent_fetches.max(1);
        settings
    }
}
