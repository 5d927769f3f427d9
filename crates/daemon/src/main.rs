mod cli;

use clap::Parser;
use owo_colors::OwoColorize;

use cli::args::Args;
use cli::op::{Op, OpContext};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let ctx = OpContext {
        config_path: args.config_path.clone(),
    };

    match args.command.execute(&ctx).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}
