//! CLI entry point for netjob.

use std::collections::HashSet;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use netjob_core::clock::SystemClock;
use netjob_core::domain::DefaultDomainNormalizer;
use netjob_core::network::{JobState, NetworkEngine, NetworkJob, NetworkServices};
use netjob_core::persist::{load_bandwidth, load_sessions, save_bandwidth, save_sessions};
use netjob_core::scheduler::{JobResult, JobScheduler, ScheduledJob};
use netjob_core::{
    BandwidthManager, Database, NetworkConfig, NetworkContext, SessionManager, SqliteStateStore,
};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::{Args, Command, FetchArgs, SessionsCommand, StateArgs};

/// How often state is written to disk during a fetch run.
const SAVE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match args.command {
        Command::Fetch(fetch_args) => fetch(fetch_args, args.quiet).await,
        Command::Bandwidth(state) => print_bandwidth(&state).await,
        Command::Sessions(SessionsCommand::Clear { domain, state }) => {
            clear_session(&domain, &state).await
        }
    }
}

async fn open_store(state: &StateArgs) -> Result<SqliteStateStore> {
    let db = Database::new(&state.state_db)
        .await
        .with_context(|| format!("opening state database {}", state.state_db.display()))?;
    Ok(SqliteStateStore::new(db))
}

fn read_urls(args: &FetchArgs) -> Result<Vec<String>> {
    let text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        String::new()
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

/// Picks a file name for `url` inside `dir`, suffixing `-N` on collisions.
fn destination_for(url: &url::Url, dir: &Path, taken: &mut HashSet<PathBuf>) -> PathBuf {
    let base = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("index.html");
    let base: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();

    let mut candidate = dir.join(&base);
    let mut n = 1;
    while taken.contains(&candidate) || candidate.exists() {
        let (stem, ext) = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
            _ => (base.as_str(), String::new()),
        };
        candidate = dir.join(format!("{stem}-{n}{ext}"));
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

async fn fetch(args: FetchArgs, quiet: bool) -> Result<()> {
    let urls = read_urls(&args)?;
    if urls.is_empty() {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/file.bin' | netjob fetch");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => NetworkConfig::load(path)?,
        None => NetworkConfig::default(),
    };
    if let Some(max_jobs) = args.max_jobs {
        config.max_jobs = usize::from(max_jobs);
    }
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let store = Arc::new(open_store(&args.state).await?);
    let services = NetworkServices::new(config)?;
    load_bandwidth(store.as_ref(), &services.bandwidth).await?;
    load_sessions(store.as_ref(), &services.sessions).await?;

    let bandwidth = Arc::clone(&services.bandwidth);
    let sessions = Arc::clone(&services.sessions);
    let shutdown = services.shutdown.clone();
    let engine = NetworkEngine::start(services);

    let scheduler = JobScheduler::new(1, shutdown.clone());
    scheduler.register_job(Arc::new(ScheduledJob::repeating(
        "save network state",
        SAVE_INTERVAL,
        SAVE_INTERVAL,
        {
            let store = Arc::clone(&store);
            let bandwidth = Arc::clone(&bandwidth);
            let sessions = Arc::clone(&sessions);
            move || {
                let store = Arc::clone(&store);
                let bandwidth = Arc::clone(&bandwidth);
                let sessions = Arc::clone(&sessions);
                async move {
                    save_bandwidth(store.as_ref(), &bandwidth).await?;
                    save_sessions(store.as_ref(), &sessions).await?;
                    JobResult::Ok(())
                }
            }
        },
    )));
    scheduler.start();

    let mut taken = HashSet::new();
    let mut jobs = Vec::with_capacity(urls.len());
    let mut rejected = 0usize;
    for raw in &urls {
        match NetworkJob::web_get(raw) {
            Ok(job) => {
                let destination = destination_for(job.url(), &args.output_dir, &mut taken);
                let job = Arc::new(job.with_destination(destination));
                engine.add_job(Arc::clone(&job));
                jobs.push(job);
            }
            Err(e) => {
                warn!(input = %raw, error = %e, "Skipped unrecognized input");
                rejected += 1;
            }
        }
    }
    info!(jobs = jobs.len(), skipped = rejected, "Queued downloads");

    let use_bars = !quiet && !args.no_progress && io::stderr().is_terminal();
    let (progress, stop_progress) = progress::spawn_progress_ui(use_bars, jobs.clone());

    let wait_all = async {
        for job in &jobs {
            job.wait_until_done().await;
        }
    };
    tokio::select! {
        () = wait_all => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            warn!("interrupted, shutting down");
        }
    }

    engine.shutdown().await;
    scheduler.shutdown().await;
    stop_progress.store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    save_bandwidth(store.as_ref(), &bandwidth).await?;
    save_sessions(store.as_ref(), &sessions).await?;

    let mut completed = 0usize;
    let mut failed = rejected;
    for job in &jobs {
        if job.state() == JobState::Done {
            completed += 1;
            debug!(url = %job.url(), path = ?job.destination(), "saved");
        } else {
            failed += 1;
            warn!(url = %job.url(), status = %job.status().text, "download failed");
        }
    }
    info!(completed, failed, total = urls.len(), "Download complete");

    if failed > 0 {
        bail!("{failed} of {} downloads failed", urls.len());
    }
    Ok(())
}

async fn print_bandwidth(state: &StateArgs) -> Result<()> {
    let store = open_store(state).await?;
    let manager = BandwidthManager::new(Arc::new(SystemClock));
    load_bandwidth(&store, &manager).await?;

    let contexts = manager.contexts_and_trackers(true);
    if contexts.is_empty() {
        println!("no bandwidth usage recorded");
        return Ok(());
    }
    for (context, tracker) in contexts {
        println!(
            "{context}: {} requests, {} all time",
            tracker.total_requests(),
            netjob_core::units::bytes_to_string(tracker.total_bytes())
        );
        for (line, _) in manager.bandwidth_strings_and_gauge_tuples(&context) {
            println!("    {line}");
        }
    }
    Ok(())
}

async fn clear_session(domain: &str, state: &StateArgs) -> Result<()> {
    let store = open_store(state).await?;
    let config = NetworkConfig::default();
    let sessions = SessionManager::new(
        Arc::new(SystemClock),
        Arc::new(DefaultDomainNormalizer),
        config.session_idle_timeout(),
    );
    load_sessions(&store, &sessions).await?;

    let context = NetworkContext::domain(domain.trim().to_ascii_lowercase());
    if sessions.clear_session(&context) {
        save_sessions(&store, &sessions).await?;
        println!("cleared session for {}", sessions.session_context(&context));
    } else {
        println!("no session stored for {}", sessions.session_context(&context));
    }
    Ok(())
}
