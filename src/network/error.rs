//! Error types for network jobs.
//!
//! Every failure a job can end in is one [`NetworkError`]. Transport errors are
//! classified when they are built, so callers match on variants instead of
//! inspecting `reqwest` errors.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

/// Which remote status class a [`NetworkError::RemoteStatus`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatusKind {
    NotFound,
    Forbidden,
    Unauthorized,
    SessionExpired,
    UpgradeRequired,
    TooManyRequests,
    ServerError,
    Other,
}

impl RemoteStatusKind {
    /// Classifies an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            403 => Self::Forbidden,
            401 => Self::Unauthorized,
            419 => Self::SessionExpired,
            426 => Self::UpgradeRequired,
            429 => Self::TooManyRequests,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

/// Errors that end a network job.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Timeout, connection reset, refused or dropped TLS session.
    #[error("network error requesting {url}: {reason}")]
    TransientNetwork { url: String, reason: String },

    #[error("redirect loop detected at {url}")]
    RedirectLoop { url: String },

    #[error("too many redirects ({max}) following {url}")]
    TooManyRedirects { url: String, max: usize },

    /// The server broke the HTTP contract, e.g. sent more than Content-Length.
    #[error("protocol violation from {url}: {reason}")]
    ProtocolViolation { url: String, reason: String },

    #[error("{status} - {}", status_reason(.status, .body))]
    RemoteStatus {
        kind: RemoteStatusKind,
        status: u16,
        body: String,
    },

    /// The OS refused the socket, usually a local firewall.
    #[error("connection to {url} blocked by the operating system: {reason}")]
    FirewallBlocked { url: String, reason: String },

    #[error("{0}")]
    VersionMismatch(String),

    #[error("login failed for {context}: {reason}")]
    LoginFailed { context: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("application is shutting down")]
    ShuttingDown,

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The task running the job panicked.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn status_reason(status: &u16, body: &str) -> String {
    let canonical = reqwest::StatusCode::from_u16(*status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Status");
    let body = body.trim();
    if body.is_empty() {
        canonical.to_string()
    } else {
        format!("{canonical}: {}", truncate(body, 200))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

impl NetworkError {
    /// Classifies a transport error.
    ///
    /// Permission errors anywhere in the source chain mean a firewall or
    /// sandbox refused the socket; everything else is transient.
    pub fn transport(url: impl Into<String>, source: &reqwest::Error) -> Self {
        let url = url.into();
        if source.is_builder() {
            return Self::InvalidUrl { url };
        }
        if is_permission_denied(source) {
            return Self::FirewallBlocked {
                url,
                reason: source.to_string(),
            };
        }
        let reason = if source.is_timeout() {
            "timed out".to_string()
        } else {
            error_chain_string(source)
        };
        Self::TransientNetwork { url, reason }
    }

    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn remote_status(status: u16, body: impl Into<String>) -> Self {
        Self::RemoteStatus {
            kind: RemoteStatusKind::from_status(status),
            status,
            body: body.into(),
        }
    }

    pub fn redirect_loop(url: impl Into<String>) -> Self {
        Self::RedirectLoop { url: url.into() }
    }

    pub fn too_many_redirects(url: impl Into<String>, max: usize) -> Self {
        Self::TooManyRedirects {
            url: url.into(),
            max,
        }
    }

    pub fn protocol_violation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn login_failed(context: impl ToString, reason: impl Into<String>) -> Self {
        Self::LoginFailed {
            context: context.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a fresh connection might succeed where this attempt failed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// The status code for remote status errors.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short text for a job's status line.
    #[must_use]
    pub fn status_text(&self) -> String {
        match self {
            Self::RemoteStatus { status, .. } => {
                let canonical = reqwest::StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("Unknown Status");
                format!("{status} - {canonical}")
            }
            Self::Cancelled => "cancelled!".to_string(),
            Self::ShuttingDown => "application shutting down!".to_string(),
            Self::TransientNetwork { .. } => "connection failed".to_string(),
            Self::RedirectLoop { .. } => "redirect loop".to_string(),
            Self::TooManyRedirects { .. } => "too many redirects".to_string(),
            Self::FirewallBlocked { .. } => "blocked by firewall".to_string(),
            Self::VersionMismatch(_) => "version mismatch".to_string(),
            Self::LoginFailed { .. } => "login failed".to_string(),
            Self::WorkerPanicked(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

fn is_permission_denied(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::PermissionDenied
        {
            return true;
        }
        current = err.source();
    }
    false
}

fn error_chain_string(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut current = error.source();
    while let Some(err) = current {
        let text = err.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = err.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_kinds() {
        assert_eq!(RemoteStatusKind::from_status(404), RemoteStatusKind::NotFound);
        assert_eq!(RemoteStatusKind::from_status(419), RemoteStatusKind::SessionExpired);
        assert_eq!(RemoteStatusKind::from_status(503), RemoteStatusKind::ServerError);
        assert_eq!(RemoteStatusKind::from_status(418), RemoteStatusKind::Other);
    }

    #[test]
    fn test_remote_status_display_and_status_text() {
        let err = NetworkError::remote_status(404, "");
        assert_eq!(err.to_string(), "404 - Not Found");
        assert_eq!(err.status_text(), "404 - Not Found");

        let err = NetworkError::remote_status(500, "database on fire");
        assert_eq!(err.to_string(), "500 - Internal Server Error: database on fire");
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn test_long_body_truncated() {
        let err = NetworkError::remote_status(500, "x".repeat(500));
        assert!(err.to_string().ends_with("..."));
        assert!(err.to_string().len() < 300);
    }

    #[test]
    fn test_only_transient_network_is_transient() {
        assert!(NetworkError::transient("http://x/", "reset").is_transient());
        assert!(!NetworkError::redirect_loop("http://x/").is_transient());
        assert!(!NetworkError::Cancelled.is_transient());
    }

    #[test]
    fn test_permission_denied_detected_in_chain() {
        #[derive(Debug, Error)]
        #[error("connect failed")]
        struct Wrapper(#[source] std::io::Error);

        let err = Wrapper(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(is_permission_denied(&err));
        assert_eq!(error_chain_string(&err), "connect failed: denied");
    }

    #[test]
    fn test_status_text_for_terminal_states() {
        assert_eq!(NetworkError::Cancelled.status_text(), "cancelled!");
        assert_eq!(
            NetworkError::login_failed("web domain: example.com", "bad password").to_string(),
            "login failed for web domain: example.com: bad password"
        );
    }
}
