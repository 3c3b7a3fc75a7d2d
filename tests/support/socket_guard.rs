//! Localhost socket availability for wiremock-based tests.
//!
//! Sandboxed CI runners sometimes refuse to bind even loopback sockets. Tests
//! then skip with a note on stderr, unless `NETJOB_REQUIRE_SOCKET_TESTS` is
//! set to a truthy value, in which case they fail loudly instead.

use std::net::{Ipv4Addr, TcpListener};

use wiremock::MockServer;

const REQUIRE_ENV: &str = "NETJOB_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_ENV).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        )
    })
}

fn loopback_available() -> Result<(), std::io::Error> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map(drop)
}

/// Starts a mock server, or returns `None` when loopback sockets are
/// unavailable and not required.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    match loopback_available() {
        Ok(()) => Some(MockServer::start().await),
        Err(e) if sockets_required() => {
            panic!("cannot bind a loopback socket ({e}) but {REQUIRE_ENV} is set")
        }
        Err(e) => {
            eprintln!("skipping socket-bound test: cannot bind loopback ({e}); set {REQUIRE_ENV}=1 to fail instead");
            None
        }
    }
}

/// Evaluates to a running [`MockServer`], or returns from the calling test.
macro_rules! require_mock_server {
    () => {{
        let Some(server) = $crate::support::socket_guard::start_mock_server_or_skip().await else {
            return;
        };
        server
    }};
}
