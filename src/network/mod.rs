//! Request execution: pooled connections with manual redirects, the job
//! state machine and the engine that drives jobs through admission, login
//! and download.

mod engine;
mod error;
mod job;
mod login;
mod pool;
mod retry;

pub use engine::{EngineError, EngineHandle, EngineStatus, NetworkEngine, NetworkServices};
pub use error::{NetworkError, RemoteStatusKind};
pub use job::{
    JobKind, JobState, JobStatus, NetworkJob, check_server_version, parse_retry_after,
};
pub use login::{LoginPolicy, LoginProcess, NoLoginRequired};
pub use pool::{
    ConnectionGuard, ConnectionKey, ConnectionPool, PooledResponse, RequestSpec,
};
pub use retry::{RetryDecision, RetryPolicy};
