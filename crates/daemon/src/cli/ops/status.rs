use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use clap::Args;
use comfy_table::Table;
use owo_colors::OwoColorize;

use common::engine::Audit;
use common::store::{ContentStore, KuboStore, StoreError};

use mirrorsync_daemon::state::{AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Status {
    /// List every mapped path instead of a summary
    #[arg(long)]
    pub all: bool,

    /// Ask the backend for pin status (needs a running node)
    #[arg(long)]
    pub pins: bool,
}

#[derive(Debug)]
pub struct StatusOutput {
    pub home: PathBuf,
    pub source_dir: PathBuf,
    pub mirror_dir: PathBuf,
    pub backups: usize,
    pub audit: Audit,
    pub pins_checked: bool,
    pub show_entries: bool,
}

impl StatusOutput {
    fn mirrored(&self) -> usize {
        self.audit.entries.iter().filter(|e| e.mirrored).count()
    }

    fn tombstoned(&self) -> usize {
        self.audit.entries.iter().filter(|e| e.tombstoned).count()
    }
}

impl fmt::Display for StatusOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", "mirrorsync".bold())?;
        writeln!(f, "  {} {}", "home:".dimmed(), self.home.display())?;
        writeln!(f, "  {} {}", "source:".dimmed(), self.source_dir.display())?;
        writeln!(f, "  {} {}", "mirror:".dimmed(), self.mirror_dir.display())?;
        writeln!(f, "  {} {}", "mapped:".dimmed(), self.audit.len())?;
        writeln!(f, "  {} {}", "mirrored:".dimmed(), self.mirrored().green())?;
        writeln!(f, "  {} {}", "deleted:".dimmed(), self.tombstoned().yellow())?;
        write!(f, "  {} {}", "backups:".dimmed(), self.backups)?;
        if self.pins_checked {
            write!(
                f,
                "\n  {} {}",
                "unpinned:".dimmed(),
                self.audit.unpinned().count().red()
            )?;
        }

        if !self.show_entries || self.audit.is_empty() {
            return Ok(());
        }

        let mut table = Table::new();
        let mut header = vec!["PATH", "CID", "MIRROR"];
        if self.pins_checked {
            header.push("PIN");
        }
        table.set_header(header);
        for entry in &self.audit.entries {
            let mirror = if entry.tombstoned {
                "deleted"
            } else if entry.mirrored {
                "present"
            } else {
                "missing"
            };
            let mut row = vec![
                entry.key.to_string(),
                entry.cid.to_string(),
                mirror.to_string(),
            ];
            if self.pins_checked {
                row.push(entry.pin_label().to_string());
            }
            table.add_row(row);
        }
        write!(f, "\n{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("state error: {0}")]
    StateError(#[from] StateError),

    #[error("backend error: {0}")]
    Backend(#[from] StoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Status {
    type Error = StatusError;
    type Output = StatusOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let mapping = state.mapping_store().load();
        let ledger = state.ledger_store().load();

        let pins = if self.pins {
            KuboStore::new(state.config.backend.kubo_config())
                .pinned()
                .await?
        } else {
            HashMap::new()
        };

        let backups = std::fs::read_dir(&state.backups_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);

        Ok(StatusOutput {
            audit: Audit::build(&mapping, &ledger, &state.mirror_dir, &pins),
            home: state.home,
            source_dir: state.source_dir,
            mirror_dir: state.mirror_dir,
            backups,
            pins_checked: self.pins,
            show_entries: self.all,
        })
    }
}
