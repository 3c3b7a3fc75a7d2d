//! Login gating collaborators.
//!
//! The engine asks a [`LoginPolicy`] whether a job's session needs a login
//! before the job may run. If so, and a login is possible, the policy builds a
//! [`LoginProcess`] that the engine runs, one at a time engine-wide.

use std::fmt::Debug;

use async_trait::async_trait;

use super::NetworkError;
use super::engine::EngineHandle;
use crate::context::NetworkContext;

/// Decides whether requests in a login context need a login first.
pub trait LoginPolicy: Send + Sync + Debug {
    /// Whether the session for `context` must log in before `url` is fetched.
    fn needs_login(&self, context: &NetworkContext, url: &str) -> bool;

    /// Whether a login can be attempted right now; `Err` carries the reason
    /// it cannot (missing credentials, script disabled).
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when no login is possible.
    fn can_login(&self, context: &NetworkContext) -> Result<(), String>;

    /// Builds the process that performs the login.
    fn generate_login_process(&self, context: &NetworkContext) -> Box<dyn LoginProcess>;
}

/// A login in progress.
///
/// The process issues its own requests as `Login` jobs through the handle, so
/// they bypass bandwidth admission and login gating.
#[async_trait]
pub trait LoginProcess: Send + Debug {
    /// Runs the login to completion.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::LoginFailed`] (or the error of the request that
    /// failed) when the login did not succeed.
    async fn start(&mut self, engine: EngineHandle) -> Result<(), NetworkError>;
}

/// Policy for engines whose sessions never need a login.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoginRequired;

impl LoginPolicy for NoLoginRequired {
    fn needs_login(&self, _context: &NetworkContext, _url: &str) -> bool {
        false
    }

    fn can_login(&self, _context: &NetworkContext) -> Result<(), String> {
        Err("no login is configured".to_string())
    }

    fn generate_login_process(&self, context: &NetworkContext) -> Box<dyn LoginProcess> {
        Box::new(FailingLogin {
            context: context.clone(),
        })
    }
}

#[derive(Debug)]
struct FailingLogin {
    context: NetworkContext,
}

#[async_trait]
impl LoginProcess for FailingLogin {
    async fn start(&mut self, _engine: EngineHandle) -> Result<(), NetworkError> {
        Err(NetworkError::login_failed(
            &self.context,
            "no login is configured",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_login_required_policy() {
        let policy = NoLoginRequired;
        let context = NetworkContext::domain("example.com");
        assert!(!policy.needs_login(&context, "https://example.com/"));
        assert!(policy.can_login(&context).is_err());
    }
}
