use clap::Args;

use mirrorsync_daemon::logging::{self, LoggingError};
use mirrorsync_daemon::state::{AppState, StateError};
use mirrorsync_daemon::spawn_service;

#[derive(Args, Debug, Clone)]
pub struct Run {
    /// Delete source files once mirrored, overriding the config
    #[arg(long)]
    pub consume_source: bool,

    /// Seconds between periodic audit + sync passes, overriding the config
    #[arg(long)]
    pub interval: Option<u64>,

    /// Do not start `ipfs daemon` if the node is not running
    #[arg(long)]
    pub no_spawn_daemon: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("state error: {0}")]
    StateError(#[from] StateError),

    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("daemon failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Run {
    type Error = RunError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        // Missing directories or an unreadable config are the only fatal errors
        let mut state = AppState::load_or_init(ctx.config_path.clone())?.ensure_dirs()?;

        if self.consume_source {
            state.config.consume_source = true;
        }
        if let Some(secs) = self.interval {
            state.config.sync_interval_secs = secs;
        }
        if self.no_spawn_daemon {
            state.config.backend.spawn_daemon = false;
        }

        let _guard = logging::init(&state.config.log_level, Some(&state.log_path()))?;

        spawn_service(state)
            .await
            .map_err(|e| RunError::Failed(format!("{:#}", e)))?;
        Ok("mirrorsync stopped".to_string())
    }
}
