//! Keyed pool of reusable keep-alive connections.
//!
//! A [`Connection`] is one `reqwest::Client` restricted to a single idle
//! socket, so holding its lock means owning that socket. Connections are
//! grouped by `(scheme, host, port)`; acquiring takes the first free one for
//! the key or opens another. The returned guard releases the connection when
//! dropped, including when a response body is abandoned halfway.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, LOCATION, REFERER};
use reqwest::{Method, StatusCode};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::NetworkError;
use super::retry::{RetryDecision, RetryPolicy};
use crate::config::{NetworkConfig, ProxySettings};
use crate::session::Session;
use crate::shutdown::Shutdown;
use crate::user_agent;

/// Identifies the origin a connection talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionKey {
    /// Builds the key for a URL, filling in the scheme's default port.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidUrl`] for URLs without a host or port.
    pub fn from_url(url: &Url) -> Result<Self, NetworkError> {
        let host = url
            .host_str()
            .ok_or_else(|| NetworkError::invalid_url(url.as_str()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| NetworkError::invalid_url(url.as_str()))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug)]
struct ConnectionState {
    client: Option<reqwest::Client>,
    last_used: Instant,
    proxy: Option<ProxySettings>,
}

/// One pooled keep-alive connection.
#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    state: Arc<tokio::sync::Mutex<ConnectionState>>,
}

/// Exclusive use of a pooled connection, released on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    key: ConnectionKey,
    state: OwnedMutexGuard<ConnectionState>,
}

impl ConnectionGuard {
    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Closes the underlying socket; the next user reconnects.
    fn invalidate(&mut self) {
        self.state.client = None;
    }

    fn touch(&mut self) {
        self.state.last_used = Instant::now();
    }
}

/// One request as the pool sends it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
    pub referral_url: Option<String>,
    pub headers: HeaderMap,
}

impl RequestSpec {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            body: None,
            referral_url: None,
            headers: HeaderMap::new(),
        }
    }
}

/// A response whose connection stays checked out until it is dropped.
#[derive(Debug)]
pub struct PooledResponse {
    pub response: reqwest::Response,
    /// The URL that produced this response, after redirects.
    pub final_url: Url,
    guard: ConnectionGuard,
}

impl PooledResponse {
    /// Splits the response from the connection guard, so the body can be
    /// streamed while the guard is held alongside.
    #[must_use]
    pub fn into_parts(self) -> (reqwest::Response, ConnectionGuard) {
        (self.response, self.guard)
    }
}

/// Pool of reusable connections keyed by origin.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: Mutex<HashMap<ConnectionKey, Vec<Arc<Connection>>>>,
    stale_after: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_redirects: usize,
    retry: RetryPolicy,
}

fn redirect_signature(method: &Method, url: &Url) -> (Method, String, String, Option<String>) {
    (
        method.clone(),
        url.host_str().unwrap_or_default().to_ascii_lowercase(),
        url.path().to_string(),
        url.query().map(str::to_string),
    )
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            stale_after: config.stale_connection_timeout(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.request_timeout(),
            max_redirects: config.max_redirects,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the reconnect policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Vec<Arc<Connection>>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of pooled connections across all keys.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn build_client(
        &self,
        proxy: Option<&ProxySettings>,
        url: &Url,
    ) -> Result<reqwest::Client, NetworkError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .pool_max_idle_per_host(1)
            .gzip(true)
            .user_agent(user_agent::default_user_agent());
        if let Some(proxy) = proxy {
            let proxy = proxy
                .to_reqwest()
                .map_err(|e| NetworkError::transient(url.as_str(), e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| NetworkError::transport(url.as_str(), &e))
    }

    /// Checks out a connection for `url`'s origin, waiting for none.
    ///
    /// A connection that sat idle past the stale timeout, or was configured
    /// with a different proxy, is reconnected before it is handed out.
    #[instrument(skip(self, proxy), fields(%url))]
    pub async fn acquire(
        &self,
        url: &Url,
        proxy: Option<&ProxySettings>,
    ) -> Result<ConnectionGuard, NetworkError> {
        let key = ConnectionKey::from_url(url)?;
        let (connection, state) = {
            let mut connections = self.lock();
            let bucket = connections.entry(key.clone()).or_default();
            let free = bucket.iter().find_map(|connection| {
                connection
                    .state
                    .clone()
                    .try_lock_owned()
                    .ok()
                    .map(|state| (connection.clone(), state))
            });
            if let Some(found) = free {
                found
            } else {
                let connection = Arc::new(Connection {
                    key: key.clone(),
                    state: Arc::new(tokio::sync::Mutex::new(ConnectionState {
                        client: None,
                        last_used: Instant::now(),
                        proxy: None,
                    })),
                });
                let Ok(state) = connection.state.clone().try_lock_owned() else {
                    return Err(NetworkError::transient(
                        url.as_str(),
                        "new connection unexpectedly locked",
                    ));
                };
                bucket.push(connection.clone());
                debug!(%key, pooled = bucket.len(), "opened pool slot");
                (connection, state)
            }
        };

        let mut guard = ConnectionGuard {
            key: connection.key.clone(),
            state,
        };
        let stale = guard.state.last_used.elapsed() >= self.stale_after;
        let proxy_changed = guard.state.proxy.as_ref() != proxy;
        if guard.state.client.is_none() || stale || proxy_changed {
            if guard.state.client.is_some() {
                debug!(%key, stale, proxy_changed, "reconnecting pooled connection");
            }
            guard.state.client = Some(self.build_client(proxy, url)?);
            guard.state.proxy = proxy.cloned();
        }
        guard.touch();
        Ok(guard)
    }

    /// Sends one request, following redirects by hand.
    ///
    /// Cookies from `session` go out on every hop and `Set-Cookie` headers
    /// from every hop are stored back. 301, 307 and 308 repeat the method and
    /// body; 302 and 303 switch to a bodiless GET.
    ///
    /// # Errors
    ///
    /// Transport failures (after reconnect retries for GET), redirect loops,
    /// and redirect chains longer than the configured maximum.
    #[instrument(skip(self, spec, session), fields(method = %spec.method, url = %spec.url))]
    pub async fn request(
        &self,
        spec: &RequestSpec,
        session: &Session,
    ) -> Result<PooledResponse, NetworkError> {
        let mut method = spec.method.clone();
        let mut url = spec.url.clone();
        let mut body = spec.body.clone();
        let mut seen = HashSet::from([redirect_signature(&method, &url)]);
        let mut hops = 0usize;

        loop {
            let (response, guard) = self
                .send_with_reconnect(&method, &url, body.clone(), spec, session)
                .await?;
            session.store_response_cookies(response.headers(), &url);

            let status = response.status();
            if !status.is_redirection() {
                return Ok(PooledResponse {
                    response,
                    final_url: url,
                    guard,
                });
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| url.join(loc).ok())
            else {
                // 304 and Location-less redirects are final
                return Ok(PooledResponse {
                    response,
                    final_url: url,
                    guard,
                });
            };

            hops += 1;
            if hops > self.max_redirects {
                return Err(NetworkError::too_many_redirects(
                    spec.url.as_str(),
                    self.max_redirects,
                ));
            }
            if matches!(status, StatusCode::FOUND | StatusCode::SEE_OTHER) {
                method = Method::GET;
                body = None;
            }
            if !seen.insert(redirect_signature(&method, &location)) {
                return Err(NetworkError::redirect_loop(location.as_str()));
            }
            debug!(%status, from = %url, to = %location, hops, "following redirect");
            url = location;
        }
    }

    async fn send_with_reconnect(
        &self,
        method: &Method,
        url: &Url,
        body: Option<Bytes>,
        spec: &RequestSpec,
        session: &Session,
    ) -> Result<(reqwest::Response, ConnectionGuard), NetworkError> {
        let proxy = session.proxy();
        let mut attempt = 1;
        loop {
            let mut guard = self.acquire(url, proxy.as_ref()).await?;
            let Some(client) = guard.state.client.clone() else {
                return Err(NetworkError::transient(url.as_str(), "connection closed"));
            };

            let mut request = client
                .request(method.clone(), url.clone())
                .headers(spec.headers.clone());
            if let Some(cookies) = session.cookie_header(url)
                && let Ok(value) = HeaderValue::from_str(&cookies)
            {
                request = request.header(COOKIE, value);
            }
            if let Some(referral) = &spec.referral_url {
                request = request.header(REFERER, referral.as_str());
            }
            if let Some(body) = body.clone() {
                request = request.body(body);
            }

            match request.send().await {
                Ok(response) => {
                    guard.touch();
                    return Ok((response, guard));
                }
                Err(e) => {
                    let error = NetworkError::transport(url.as_str(), &e);
                    guard.invalidate();
                    drop(guard);
                    if *method != Method::GET {
                        return Err(error);
                    }
                    match self.retry.should_retry(&error, attempt) {
                        RetryDecision::Retry {
                            delay,
                            attempt: next,
                        } => {
                            warn!(%url, attempt, error = %error, "request failed, reconnecting");
                            tokio::time::sleep(delay).await;
                            attempt = next;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%url, reason, "giving up on request");
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Closes connections idle past the stale timeout. In-use connections are
    /// never touched. Returns how many were closed.
    pub fn reap_stale(&self) -> usize {
        let mut connections = self.lock();
        let mut closed = 0;
        for bucket in connections.values_mut() {
            bucket.retain(|connection| match connection.state.try_lock() {
                Ok(state) if state.last_used.elapsed() >= self.stale_after => {
                    closed += 1;
                    false
                }
                _ => true,
            });
        }
        connections.retain(|_, bucket| !bucket.is_empty());
        if closed > 0 {
            debug!(closed, "reaped stale connections");
        }
        closed
    }

    /// Runs [`reap_stale`](Self::reap_stale) periodically until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        pool.reap_stale();
                    }
                    () = shutdown.wait() => {
                        info!("connection reaper stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(&NetworkConfig::default())
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_connection_key_default_ports() {
        let key = ConnectionKey::from_url(&url("https://Example.com/a")).unwrap();
        assert_eq!(key.to_string(), "https://example.com:443");
        let key = ConnectionKey::from_url(&url("http://example.com:8080/a")).unwrap();
        assert_eq!(key.port, 8080);
        assert!(ConnectionKey::from_url(&url("data:text/plain,hi")).is_err());
    }

    #[test]
    fn test_redirect_signature_distinguishes_query_and_method() {
        let a = redirect_signature(&Method::GET, &url("https://x.com/p?q=1"));
        let b = redirect_signature(&Method::GET, &url("https://x.com/p?q=2"));
        let c = redirect_signature(&Method::POST, &url("https://x.com/p?q=1"));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_acquire_rejects_url_without_host() {
        let pool = pool();
        let result = tokio_test::block_on(pool.acquire(&url("data:text/plain,hi"), None));
        assert!(matches!(result, Err(NetworkError::InvalidUrl { .. })));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = pool();
        let target = url("http://127.0.0.1:9/");
        let guard = pool.acquire(&target, None).await.unwrap();
        drop(guard);
        let _guard = pool.acquire(&target, None).await.unwrap();
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_busy_connection_opens_another() {
        let pool = pool();
        let target = url("http://127.0.0.1:9/");
        let _first = pool.acquire(&target, None).await.unwrap();
        let _second = pool.acquire(&target, None).await.unwrap();
        assert_eq!(pool.connection_count(), 2);

        let _other = pool.acquire(&url("http://127.0.0.2:9/"), None).await.unwrap();
        assert_eq!(pool.connection_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_closes_only_idle_connections() {
        let pool = pool();
        let idle = pool.acquire(&url("http://127.0.0.1:9/"), None).await.unwrap();
        drop(idle);
        let busy = pool.acquire(&url("http://127.0.0.2:9/"), None).await.unwrap();

        assert_eq!(pool.reap_stale(), 0);
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(pool.reap_stale(), 1);
        assert_eq!(pool.connection_count(), 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let pool = Arc::new(pool());
        let shutdown = Shutdown::new();
        let handle = pool.spawn_reaper(Duration::from_secs(60), shutdown.clone());
        shutdown.trigger();
        assert!(
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_ok()
        );
    }
}
