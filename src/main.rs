mod cli;
mod commands;
mod config;
mod coordinator;
mod error;
mod extractor;
mod fetcher;
mod formats;
mod hashing;
mod logging;
mod model;
mod muxer;
mod planner;
mod progress;
mod resume;
mod state;
#[cfg(test)]
mod testing;
mod utils;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use crate::cli::{Args, Command};
use crate::error::DownloadError;
use crate::logging::LogOptions;

fn main() -> ExitCode {
    let args = Args::parse();
    let guard = match logging::init(&LogOptions {
        verbose: args.verbose,
        log_file: args.log_file.clone(),
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    let code = match run(args.command) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };
    // flush the file log before leaving
    drop(guard);
    ExitCode::from(code)
}

fn run(command: Command) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match command {
            Command::Download(args) => commands::run_download(args).await,
            Command::Info(args) => commands::show_info(args).await,
            Command::List(args) => commands::list_records(args).await,
        }
    })
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<DownloadError>()
        .map(DownloadError::exit_code)
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}
