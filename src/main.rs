mod cli;
mod commands;

use anyhow::{bail, Result};
use clap::Parser;
use clipfetch::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Links to download (post, reel, video page...). Ignored when --tasks-file is given
    #[arg(index = 1)]
    urls: Vec<String>,

    /// File containing links, one per line
    #[arg(short = 't', long = "tasks-file")]
    tasks_file: Option<PathBuf>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir")]
    download_dir: Option<PathBuf>,

    /// Base URL of the processing server
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Maximum number of simultaneous downloads
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Attempts against the processing server before giving up
    #[arg(short = 'a', long)]
    attempts: Option<u32>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Maximum number of range requests per file (at most 8)
    #[arg(long)]
    chunks: Option<usize>,

    /// Where download history is kept
    #[arg(long = "history-file")]
    history_file: Option<PathBuf>,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print processing server version and capabilities, then exit
    #[arg(short = 'i', long)]
    info: bool,

    /// List previously downloaded files, then exit
    #[arg(short = 'l', long)]
    history: bool,

    #[arg(long = "log-level", value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&args)?;

    if args.history {
        return crate::commands::show_history(&config);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.info {
            return crate::commands::show_server_info(&config).await;
        }

        let urls = match &args.tasks_file {
            Some(path) => crate::commands::read_tasks_file(path).await?,
            None => args.urls.clone(),
        };
        if urls.is_empty() {
            bail!("Nothing to download: pass one or more links or --tasks-file");
        }
        crate::commands::run_downloads(config, urls).await
    })
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(server) = &args.server {
        config.server_url = server.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent_downloads = concurrency;
    }
    if let Some(attempts) = args.attempts {
        config.max_attempts = attempts;
    }
    if let Some(limit) = args.rate_limit {
        config.rate_limit_bytes_per_sec = Some(limit);
    }
    if let Some(chunks) = args.chunks {
        config.max_chunks = chunks;
    }
    if let Some(history) = &args.history_file {
        config.history_path = history.clone();
    }

    // Resolve to absolute so log lines and history entries are unambiguous.
    if config.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            config.download_dir = cwd.join(&config.download_dir);
        }
    }
    Ok(config)
}
