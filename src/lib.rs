//! netjob core library
//!
//! A network job engine: HTTP requests run as jobs that pass bandwidth
//! admission and login gating before a bounded pool of workers downloads
//! them over pooled connections with per-domain cookie sessions.
//!
//! # Architecture
//!
//! - [`bandwidth`] - usage trackers, rules, admission control and politeness tokens
//! - [`session`] - cookie sessions per network context
//! - [`network`] - connection pool, jobs and the engine that drives them
//! - [`scheduler`] - time-based job scheduler and the worker pool
//! - [`persist`] / [`db`] - saving bandwidth and session state to SQLite
//! - [`config`] - tunables loaded from JSON

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod domain;
pub mod network;
pub mod persist;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod units;
mod user_agent;

// Re-export commonly used types
pub use bandwidth::{BandwidthManager, BandwidthRule, BandwidthRules, BandwidthTracker};
pub use config::{ConfigError, NetworkConfig};
pub use context::{ContextType, NetworkContext};
pub use db::Database;
pub use network::{
    JobKind, JobState, NetworkEngine, NetworkError, NetworkJob, NetworkServices,
};
pub use persist::{SqliteStateStore, StateStore, StoreError};
pub use scheduler::{JobScheduler, ScheduledJob};
pub use session::{Session, SessionManager};
pub use shutdown::Shutdown;
