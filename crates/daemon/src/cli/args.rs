use std::path::PathBuf;

use clap::Parser;

use super::Command;

#[derive(Parser, Debug)]
#[command(name = "mirrorsync", version, about = "Mirror a directory through a Kubo node")]
pub struct Args {
    /// Home directory holding config.toml and data/ (default: ~/.mirrorsync)
    #[arg(long, global = true, env = "MIRRORSYNC_HOME")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}
