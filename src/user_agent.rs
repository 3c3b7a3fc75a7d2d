//! User-Agent string sent by every pooled connection.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/netjob";

/// Default User-Agent: `netjob/<version> (+<project url>)`.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("netjob/{version} (+{PROJECT_UA_URL})")
}
