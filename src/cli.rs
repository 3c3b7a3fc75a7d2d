//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Default location of the persisted bandwidth and session state.
pub const DEFAULT_STATE_DB: &str = "netjob.db";

/// Fetch URLs through a bandwidth-aware network engine.
///
/// Requests are admitted against per-domain and global bandwidth rules,
/// share cookie sessions per domain and reuse pooled connections. Usage
/// history and cookies persist between runs.
#[derive(Parser, Debug)]
#[command(name = "netjob")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download URLs (from arguments or stdin) concurrently
    Fetch(FetchArgs),

    /// Print bandwidth usage per network context
    Bandwidth(StateArgs),

    /// Manage persisted cookie sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),
}

#[derive(ClapArgs, Debug)]
pub struct StateArgs {
    /// SQLite file holding bandwidth and session state
    #[arg(long, default_value = DEFAULT_STATE_DB)]
    pub state_db: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct FetchArgs {
    /// URLs to download; read from stdin when omitted
    pub urls: Vec<String>,

    /// Directory downloaded files are written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Maximum concurrent downloads (1-100), overrides the config file
    #[arg(short = 'j', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_jobs: Option<u8>,

    /// JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,

    #[command(flatten)]
    pub state: StateArgs,
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// Forget every cookie stored for a domain
    Clear {
        /// Domain whose session is cleared (subdomains share it)
        domain: String,

        #[command(flatten)]
        state: StateArgs,
    },
}
