// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use tapedeck::config::{load_config, load_config_from, Config};
use tapedeck::download::{
    destination_name, format_bytes, DownloadManager, HttpProbe, HttpTransport, NetworkObserver,
    Phase, RecordStore, StaticProbe, Storage, TransferHandle, TransferRequest,
};
use tapedeck::DownloadError;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - at least one download failed
    pub const ERROR: i32 = 1;
    /// Temporary failure - interrupted, try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or unreadable config
    pub const CONFIG: i32 = 78;
}

#[derive(Parser)]
#[command(name = "tapedeck", version, about = "Network-aware background media downloader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the storage directory
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    ///
    /// Examples:
    ///   tapedeck fetch https://media.example/ep1.mp3
    ///   tapedeck fetch -j 2 URL1 URL2 URL3
    Fetch {
        #[arg(required = true)]
        urls: Vec<Url>,

        /// Maximum simultaneous downloads
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,

        /// Local file name (only with a single URL)
        #[arg(short = 'o', long)]
        name: Option<String>,

        /// Never download over a metered connection
        #[arg(long)]
        no_cellular: bool,
    },
    /// List completed downloads
    List,
    /// Print the local file for a downloaded URL
    Path { url: Url },
    /// Delete a downloaded file and its record
    Delete { path: PathBuf },
    /// Show disk usage of completed downloads
    Usage,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "tapedeck=debug" } else { "tapedeck=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let loaded = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "config error:".red().bold(), e);
            return Ok(exit_codes::CONFIG);
        }
    };
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }

    match cli.command {
        Commands::Fetch { urls, max_concurrent, name, no_cellular } => {
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            if no_cellular {
                config.allow_cellular = false;
            }
            if let Err(e) = config.validate() {
                eprintln!("{} {:#}", "config error:".red().bold(), e);
                return Ok(exit_codes::CONFIG);
            }
            if name.is_some() && urls.len() > 1 {
                anyhow::bail!("--name can only be used with a single URL");
            }
            fetch(&config, urls, name).await
        }
        Commands::List => list(&config),
        Commands::Path { url } => print_path(&config, &url),
        Commands::Delete { path } => delete(&config, &path),
        Commands::Usage => usage(&config),
    }
}

async fn fetch(config: &Config, urls: Vec<Url>, name: Option<String>) -> Result<i32> {
    let storage = Storage::open(&config.storage_dir)
        .with_context(|| format!("Cannot open storage directory {}", config.storage_dir.display()))?;
    let transport = Arc::new(HttpTransport::new(config.progress_interval())?);

    let interval = Duration::from_secs(config.network.probe_interval_secs);
    let (_observer, network) = match &config.network.probe_url {
        Some(probe_url) => {
            let timeout = Duration::from_secs(config.network.probe_timeout_secs);
            let probe = HttpProbe::new(probe_url.clone(), timeout, config.network.metered)?;
            NetworkObserver::spawn(probe, interval)
        }
        None => NetworkObserver::spawn(StaticProbe(config.initial_path()), interval),
    };

    let manager = DownloadManager::start(
        storage,
        config.scheduler(),
        transport,
        config.initial_path(),
        network,
    );

    let multi = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg:32!} [{bar:30.cyan/blue}] {bytes:>10}/{total_bytes:<10} {bytes_per_sec}")?
        .progress_chars("█▓░");

    let mut failed = 0usize;
    let mut followers = JoinSet::new();
    for url in urls {
        let mut request = TransferRequest::new(url.clone());
        if let Some(name) = &name {
            request = request.with_destination_hint(name.clone());
        }
        let label = destination_name(request.destination_hint.as_deref(), &url, request.id);

        match manager.enqueue(request).await {
            Ok(handle) => {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(style.clone());
                bar.set_message(label.clone());
                bar.enable_steady_tick(Duration::from_millis(100));
                followers.spawn(follow(handle, bar, label));
            }
            Err(DownloadError::AlreadyPresent(state)) => {
                let path = state
                    .local_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                println!("{} {} already downloaded: {}", "[✓]".green(), url, path);
            }
            Err(e) => {
                println!("{} {}: {}", "[✗]".red(), url, e);
                failed += 1;
            }
        }
    }

    let interrupted = tokio::select! {
        _ = async {
            while let Some(finished) = followers.join_next().await {
                if !matches!(finished, Ok(true)) {
                    failed += 1;
                }
            }
        } => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    manager.shutdown().await?;

    if interrupted {
        followers.abort_all();
        println!("{} Interrupted; unfinished downloads were stopped", "[!]".yellow());
        return Ok(exit_codes::TEMP_FAIL);
    }
    if failed > 0 {
        println!("{} {} download(s) failed", "[✗]".red(), failed);
        return Ok(exit_codes::ERROR);
    }
    Ok(exit_codes::SUCCESS)
}

/// Drive one progress bar from a transfer's state stream. Returns true on completion.
async fn follow(mut handle: TransferHandle, bar: ProgressBar, label: String) -> bool {
    while let Some(state) = handle.next().await {
        if let Some(total) = state.total_bytes {
            bar.set_length(total);
        }
        bar.set_position(state.downloaded_bytes);
        match &state.phase {
            Phase::Paused(reason) => bar.set_message(format!("{label} (paused: {reason:?})")),
            Phase::Pending if state.last_error.is_some() => {
                bar.set_message(format!("{label} (waiting for unmetered network)"))
            }
            Phase::Downloading => match state.eta_string() {
                Some(eta) => bar.set_message(format!("{label} ({eta} left)")),
                None => bar.set_message(label.clone()),
            },
            _ => {}
        }
    }

    let Some(last) = handle.last() else {
        bar.abandon();
        return false;
    };
    match &last.phase {
        Phase::Completed => {
            let path = last
                .local_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            bar.finish_with_message(format!("{label} {} {path}", "done".green()));
            true
        }
        Phase::Failed(reason) => {
            bar.abandon_with_message(format!("{label} {} {reason}", "failed".red()));
            false
        }
        Phase::Cancelled => {
            bar.abandon_with_message(format!("{label} {}", "cancelled".yellow()));
            false
        }
        _ => {
            bar.abandon_with_message(format!("{label} {}", "stopped".yellow()));
            false
        }
    }
}

fn open_records(config: &Config) -> Result<RecordStore> {
    let storage = Storage::open(&config.storage_dir)
        .with_context(|| format!("Cannot open storage directory {}", config.storage_dir.display()))?;
    let mut store = RecordStore::new(storage.record_file());
    store.load();
    Ok(store)
}

fn list(config: &Config) -> Result<i32> {
    let store = open_records(config)?;
    if store.records().is_empty() {
        println!("No downloads yet.");
        return Ok(exit_codes::SUCCESS);
    }
    for record in store.records() {
        println!(
            "{}  {:>10}  {}",
            record.completed_at.format("%Y-%m-%d %H:%M"),
            format_bytes(record.file_size),
            record.local_path.display()
        );
        println!("    {}", record.source_url.as_str().dimmed());
    }
    Ok(exit_codes::SUCCESS)
}

fn print_path(config: &Config, url: &Url) -> Result<i32> {
    let store = open_records(config)?;
    match store.find_by_source(url) {
        Some(record) => {
            println!("{}", record.local_path.display());
            Ok(exit_codes::SUCCESS)
        }
        None => {
            eprintln!("{} {} has not been downloaded", "[✗]".red(), url);
            Ok(exit_codes::ERROR)
        }
    }
}

fn delete(config: &Config, path: &Path) -> Result<i32> {
    let mut store = open_records(config)?;
    let canonical = fs::canonicalize(path).ok();
    let local_path = store
        .records()
        .iter()
        .map(|record| record.local_path.clone())
        .find(|local| local == path || (canonical.is_some() && fs::canonicalize(local).ok() == canonical));

    let Some(local_path) = local_path else {
        eprintln!("{} No download recorded at {}", "[✗]".red(), path.display());
        return Ok(exit_codes::ERROR);
    };

    let storage = Storage::open(&config.storage_dir)?;
    storage.delete(&local_path)?;
    let record = store.remove(&local_path)?;
    println!(
        "{} Deleted {} ({})",
        "[✓]".green(),
        record.local_path.display(),
        format_bytes(record.file_size)
    );
    Ok(exit_codes::SUCCESS)
}

fn usage(config: &Config) -> Result<i32> {
    let store = open_records(config)?;
    println!(
        "{} file(s), {} in {}",
        store.records().len(),
        format_bytes(store.total_bytes()),
        config.storage_dir.display()
    );
    Ok(exit_codes::SUCCESS)
}
