mod cli;
mod commands;
mod config;
mod coordinator;
mod error;
mod logging;
mod plan;
mod progress;
mod registry;
mod state;
mod store;
mod transport;
mod utils;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Args, Command};

fn main() -> Result<()> {
    let mut args = Args::parse();
    crate::logging::init(args.verbose);

    // Resolve the download dir against the launch directory up front
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let coordinator = crate::commands::open_coordinator(args.engine_config())?;
        match args.command {
            Command::Get { url, name } => crate::commands::run_get(&coordinator, &url, &name).await,
            Command::Resume { id } => crate::commands::run_resume(&coordinator, id).await,
            Command::Retry { id, full } => crate::commands::run_retry(&coordinator, id, full).await,
            Command::Status { id, format } => crate::commands::show_status(&coordinator, id, format),
            Command::List => crate::commands::list_downloads(&coordinator),
        }
    })
}
