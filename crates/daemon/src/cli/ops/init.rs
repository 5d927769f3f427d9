use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use mirrorsync_daemon::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Name of this node, used for the log file name
    #[arg(long, default_value = "local")]
    pub node_name: String,

    /// Directory to pick new files up from (relative to the home directory)
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Directory to mirror content into (relative to the home directory)
    #[arg(long)]
    pub mirror_dir: Option<PathBuf>,

    /// Delete source files once they have been mirrored
    #[arg(long)]
    pub consume_source: bool,

    /// Only mirror files with this extension (repeatable)
    #[arg(long = "extension")]
    pub extensions: Vec<String>,

    /// Path to the `ipfs` binary
    #[arg(long, env = "MIRRORSYNC_IPFS_BINARY")]
    pub ipfs_binary: Option<PathBuf>,

    /// Kubo repository directory (default: ~/.ipfs)
    #[arg(long)]
    pub repo_path: Option<PathBuf>,

    /// Stay on a private swarm instead of reconfiguring the node for the
    /// public network
    #[arg(long)]
    pub private_network: bool,
}

#[derive(Debug)]
pub struct InitOutput {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub source_dir: PathBuf,
    pub mirror_dir: PathBuf,
    pub log_path: PathBuf,
    pub binary: PathBuf,
    pub consume_source: bool,
}

impl fmt::Display for InitOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} mirrorsync at {}",
            "Initialized".green().bold(),
            self.home.display().to_string().bold()
        )?;
        writeln!(f, "  {} {}", "Config:".dimmed(), self.config_path.display())?;
        writeln!(f, "  {} {}", "Source:".dimmed(), self.source_dir.display())?;
        writeln!(f, "  {} {}", "Mirror:".dimmed(), self.mirror_dir.display())?;
        writeln!(f, "  {} {}", "Log:".dimmed(), self.log_path.display())?;
        writeln!(f, "  {} {}", "ipfs:".dimmed(), self.binary.display())?;
        write!(f, "  {} {}", "Consume source:".dimmed(), self.consume_source)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

impl Init {
    fn build_config(&self) -> AppConfig {
        let mut config = AppConfig {
            node_name: self.node_name.clone(),
            consume_source: self.consume_source,
            include_extensions: self.extensions.clone(),
            ..AppConfig::default()
        };
        if let Some(dir) = &self.source_dir {
            config.source_dir = dir.clone();
        }
        if let Some(dir) = &self.mirror_dir {
            config.mirror_dir = dir.clone();
        }
        if let Some(binary) = &self.ipfs_binary {
            config.backend.binary = binary.clone();
        }
        config.backend.repo_path = self.repo_path.clone();
        config.backend.public_network = !self.private_network;
        config
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = InitOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::init(ctx.config_path.clone(), Some(self.build_config()))?;

        Ok(InitOutput {
            log_path: state.log_path(),
            home: state.home,
            config_path: state.config_path,
            source_dir: state.source_dir,
            mirror_dir: state.mirror_dir,
            binary: state.config.backend.binary,
            consume_source: state.config.consume_source,
        })
    }
}
