use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dayfeed_adapters::{load_payload_file, RowNormalizer};
use dayfeed_core::TargetWindow;
use dayfeed_sync::{
    fetch_to_dir, load_config, open_store, preview_lines, resolve_window, run_feed, AppConfig,
    DocumentStore, FeedConfig, RunContext,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dayfeed")]
#[command(about = "Collects a daily published CSV file into one document per target date")]
struct Cli {
    /// Config file (default: feeds.local.yaml if present, else feeds.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Default, Args)]
struct WindowArgs {
    /// Feed key from the config (default: default_feed)
    #[arg(long)]
    feed: Option<String>,
    /// Target date, YYYY-MM-DD (default: tomorrow in the feed's timezone)
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    end_date: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, normalize and upsert one target date
    Run {
        #[command(flatten)]
        window: WindowArgs,
        /// Write to an in-memory store instead of the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Single download attempt saved to disk, with a short preview
    Fetch {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Normalize a local CSV file and print the rows as JSON
    Normalize {
        #[arg(long)]
        feed: Option<String>,
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the URL for the target window
    Url {
        #[command(flatten)]
        window: WindowArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "dayfeed failed");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let command = cli.command.unwrap_or(Commands::Run {
        window: WindowArgs::default(),
        dry_run: false,
    });

    match command {
        Commands::Run { window, dry_run } => run(&config, &window, dry_run).await,
        Commands::Fetch { window, out } => fetch(&config, &window, &out).await,
        Commands::Normalize { feed, file } => normalize(&config, feed.as_deref(), &file),
        Commands::Url { window } => {
            let (_, feed, target) = select(&config, &window)?;
            println!("{}", target.render(&feed.url_template)?);
            Ok(())
        }
    }
}

fn select<'a>(
    config: &'a AppConfig,
    args: &'a WindowArgs,
) -> Result<(&'a str, &'a FeedConfig, TargetWindow)> {
    let (key, feed) = config.feed(args.feed.as_deref())?;
    let tz = feed.schema.tz()?;
    let window = resolve_window(args.date.as_deref(), args.end_date.as_deref(), &tz, Utc::now())?;
    Ok((key, feed, window))
}

async fn run(config: &AppConfig, args: &WindowArgs, dry_run: bool) -> Result<()> {
    let (feed_key, feed, window) = select(config, args)?;
    let downloader = config.http.build_downloader()?;
    let archive = config.archive();
    let store = open_store(config, dry_run)?;

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = run_feed(RunContext {
        feed_key,
        feed,
        window,
        downloader: &downloader,
        store: store.as_ref(),
        archive: archive.as_ref(),
        cancel: &cancel,
    })
    .await;

    watcher.abort();
    store.close().await;

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn fetch(config: &AppConfig, args: &WindowArgs, out: &Path) -> Result<()> {
    let (feed_key, feed, window) = select(config, args)?;
    let downloader = config.http.build_downloader()?;
    let fetched = fetch_to_dir(&downloader, feed_key, feed, &window, out).await?;

    println!(
        "saved {} ({} bytes, {} lines)",
        fetched.path.display(),
        fetched.payload.bytes.len(),
        fetched.payload.line_count()
    );
    for line in preview_lines(&fetched.payload.bytes, 3) {
        println!("{line}");
    }
    Ok(())
}

fn normalize(config: &AppConfig, feed: Option<&str>, file: &Path) -> Result<()> {
    let (_, feed) = config.feed(feed)?;
    let normalizer = RowNormalizer::new(feed.schema.clone())?;
    let report = normalizer.normalize(load_payload_file(file)?);
    info!(
        rows_read = report.rows_read,
        rows_kept = report.rows.len(),
        rows_dropped = report.dropped.len(),
        "normalized {}",
        file.display()
    );
    println!("{}", serde_json::to_string_pretty(&report.rows)?);
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    shutdown_signal().await;
    warn!("shutdown requested; cancelling run");
    cancel.cancel();
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM");
            ctrl_c().await;
            info!(signal = "SIGINT", "signal received");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => info!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "signal received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
    info!(signal = "ctrl-c", "signal received");
}
