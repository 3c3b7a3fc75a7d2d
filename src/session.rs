//! Cookie sessions keyed by network context.
//!
//! Web domains share one session per registrable domain, so a login on
//! `www.example.com` is visible to `img.example.com`. Every other context type
//! keeps its own session. A session that sits unused longer than its idle
//! timeout loses its session-only cookies on next access; cookies with an
//! explicit expiry survive.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cookie_store::CookieStore;
use reqwest::header::{HeaderMap, SET_COOKIE};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::ProxySettings;
use crate::context::{ContextType, NetworkContext};
use crate::domain::DomainNormalizer;

/// Errors from session (de)serialization.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to serialize cookies for {context}: {reason}")]
    Serialize { context: String, reason: String },

    #[error("failed to load cookies for {context}: {reason}")]
    Deserialize { context: String, reason: String },
}

#[derive(Debug)]
struct SessionMeta {
    last_used: u64,
    proxy: Option<ProxySettings>,
}

/// One cookie jar plus the proxy it was last configured with.
pub struct Session {
    context: NetworkContext,
    cookies: Mutex<CookieStore>,
    meta: Mutex<SessionMeta>,
    /// Set whenever the cookie jar changes; cleared by the manager on save.
    dirty: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // cookie values are credentials; only count them
        f.debug_struct("Session")
            .field("context", &self.context)
            .field("cookies", &self.cookie_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    fn new(context: NetworkContext, now: u64, proxy: Option<ProxySettings>) -> Self {
        Self::with_store(context, CookieStore::default(), now, proxy)
    }

    fn with_store(
        context: NetworkContext,
        store: CookieStore,
        now: u64,
        proxy: Option<ProxySettings>,
    ) -> Self {
        Self {
            context,
            cookies: Mutex::new(store),
            meta: Mutex::new(SessionMeta {
                last_used: now,
                proxy,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// The (normalized) context this session belongs to.
    #[must_use]
    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    /// The proxy this session routes through.
    #[must_use]
    pub fn proxy(&self) -> Option<ProxySettings> {
        lock(&self.meta).proxy.clone()
    }

    /// Unix time of the last access through the manager.
    #[must_use]
    pub fn last_used(&self) -> u64 {
        lock(&self.meta).last_used
    }

    /// Number of stored cookies, expired ones included.
    #[must_use]
    pub fn cookie_count(&self) -> usize {
        lock(&self.cookies).iter_any().count()
    }

    /// Whether an unexpired cookie called `name` would be sent to `url`.
    #[must_use]
    pub fn has_cookie(&self, url: &Url, name: &str) -> bool {
        lock(&self.cookies)
            .get_request_values(url)
            .any(|(cookie_name, _)| cookie_name == name)
    }

    /// The `Cookie` header value for a request to `url`, if any cookie matches.
    #[must_use]
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let store = lock(&self.cookies);
        let pairs: Vec<String> = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    /// Stores every `Set-Cookie` header of a response to `url`.
    pub fn store_response_cookies(&self, headers: &HeaderMap, url: &Url) {
        let mut store = lock(&self.cookies);
        for value in headers.get_all(SET_COOKIE) {
            let Ok(text) = value.to_str() else {
                debug!("skipping non-ascii Set-Cookie header");
                continue;
            };
            match store.parse(text, url) {
                Ok(_) => self.dirty.store(true, Ordering::Release),
                Err(e) => debug!(error = %e, "rejected Set-Cookie header"),
            }
        }
    }

    /// Adds a cookie as though `url` had set it.
    pub fn add_cookie(&self, set_cookie: &str, url: &Url) {
        match lock(&self.cookies).parse(set_cookie, url) {
            Ok(_) => self.dirty.store(true, Ordering::Release),
            Err(e) => warn!(error = %e, "rejected cookie"),
        }
    }

    /// Drops every cookie without an explicit expiry.
    pub fn wipe_session_only_cookies(&self) {
        let mut store = lock(&self.cookies);
        let before = store.iter_any().count();
        let persistent = store
            .iter_any()
            .filter(|cookie| cookie.is_persistent())
            .cloned()
            .map(Ok::<_, Infallible>);
        let kept = match CookieStore::from_cookies(persistent, true) {
            Ok(kept) => kept,
            Err(never) => match never {},
        };
        if kept.iter_any().count() != before {
            self.dirty.store(true, Ordering::Release);
        }
        *store = kept;
    }

    /// Whether the cookie jar changed since the manager last saved it.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Serializes the persistent, unexpired cookies as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialize`] if the cookie store cannot be written.
    pub fn to_json(&self) -> Result<String, SessionError> {
        let store = lock(&self.cookies);
        let mut out = Vec::new();
        cookie_store::serde::json::save(&store, &mut out).map_err(|e| SessionError::Serialize {
            context: self.context.to_string(),
            reason: e.to_string(),
        })?;
        String::from_utf8(out).map_err(|e| SessionError::Serialize {
            context: self.context.to_string(),
            reason: e.to_string(),
        })
    }

    fn touch(&self, now: u64, timeout: Duration, proxy: Option<&ProxySettings>) {
        let mut meta = lock(&self.meta);
        if now.saturating_sub(meta.last_used) >= timeout.as_secs() {
            debug!(context = %self.context, "session idle past timeout, wiping session cookies");
            self.wipe_session_only_cookies();
        }
        meta.last_used = now;
        if meta.proxy.as_ref() != proxy {
            debug!(context = %self.context, "applying changed proxy to session");
            meta.proxy = proxy.cloned();
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    sessions: HashMap<NetworkContext, Arc<Session>>,
    timeouts: HashMap<NetworkContext, Duration>,
    proxy: Option<ProxySettings>,
    dirty: bool,
}

/// Owns every [`Session`], creating them lazily.
#[derive(Debug)]
pub struct SessionManager {
    clock: Arc<dyn Clock>,
    normalizer: Arc<dyn DomainNormalizer>,
    default_timeout: Duration,
    state: Mutex<SessionState>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        normalizer: Arc<dyn DomainNormalizer>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            clock,
            normalizer,
            default_timeout,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Maps a context to the one its session is stored under.
    #[must_use]
    pub fn session_context(&self, context: &NetworkContext) -> NetworkContext {
        match (context.context_type(), context.data()) {
            (ContextType::Domain, Some(domain)) => {
                NetworkContext::domain(self.normalizer.second_level_domain(domain))
            }
            _ => context.clone(),
        }
    }

    /// Returns the session for `context`, creating it on first use.
    ///
    /// Each access refreshes the idle timer, first wiping session-only
    /// cookies if the timer had already run out, and applies the current
    /// proxy if it changed.
    #[instrument(skip(self), fields(%context))]
    pub fn get_session(&self, context: &NetworkContext) -> Arc<Session> {
        let key = self.session_context(context);
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let proxy = state.proxy.clone();
        let timeout = state
            .timeouts
            .get(&key)
            .copied()
            .unwrap_or(self.default_timeout);

        if let Some(session) = state.sessions.get(&key) {
            let session = session.clone();
            session.touch(now, timeout, proxy.as_ref());
            return session;
        }

        debug!(session = %key, "creating session");
        let session = Arc::new(Session::new(key.clone(), now, proxy));
        state.sessions.insert(key, session.clone());
        state.dirty = true;
        session
    }

    /// Discards the session for `context` and all its cookies.
    #[instrument(skip(self), fields(%context))]
    pub fn clear_session(&self, context: &NetworkContext) -> bool {
        let key = self.session_context(context);
        let mut state = lock(&self.state);
        let removed = state.sessions.remove(&key).is_some();
        if removed {
            state.dirty = true;
            debug!(session = %key, "cleared session");
        }
        removed
    }

    /// Changes the proxy; sessions pick it up on their next access.
    pub fn set_proxy(&self, proxy: Option<ProxySettings>) {
        lock(&self.state).proxy = proxy;
    }

    #[must_use]
    pub fn proxy(&self) -> Option<ProxySettings> {
        lock(&self.state).proxy.clone()
    }

    /// Overrides the idle timeout for one context.
    pub fn set_session_timeout(&self, context: &NetworkContext, timeout: Duration) {
        let key = self.session_context(context);
        lock(&self.state).timeouts.insert(key, timeout);
    }

    /// Contexts that currently hold a session.
    #[must_use]
    pub fn session_contexts(&self) -> Vec<NetworkContext> {
        let mut contexts: Vec<_> = lock(&self.state).sessions.keys().cloned().collect();
        contexts.sort();
        contexts
    }

    /// Whether a session was added, removed or had its cookies changed
    /// since the last [`mark_clean`](Self::mark_clean).
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let state = lock(&self.state);
        state.dirty || state.sessions.values().any(|session| session.is_dirty())
    }

    pub fn mark_clean(&self) {
        let mut state = lock(&self.state);
        state.dirty = false;
        for session in state.sessions.values() {
            session.dirty.store(false, Ordering::Release);
        }
    }

    /// Flags the sessions as unsaved, e.g. after a failed write.
    pub fn mark_dirty(&self) {
        lock(&self.state).dirty = true;
    }

    /// Serializes every non-ephemeral session.
    ///
    /// # Errors
    ///
    /// Fails on the first session whose cookies cannot be written.
    pub fn persistent_sessions(&self) -> Result<Vec<(NetworkContext, String)>, SessionError> {
        let sessions: Vec<Arc<Session>> = lock(&self.state)
            .sessions
            .values()
            .filter(|session| !session.context().is_ephemeral())
            .cloned()
            .collect();
        let mut out = sessions
            .iter()
            .map(|session| Ok((session.context().clone(), session.to_json()?)))
            .collect::<Result<Vec<_>, SessionError>>()?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Installs a session from JSON. Session-only cookies are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Deserialize`] if the JSON is not a cookie store.
    pub fn load_session(&self, context: NetworkContext, json: &str) -> Result<(), SessionError> {
        if context.is_ephemeral() {
            warn!(%context, "ignoring persisted ephemeral session");
            return Ok(());
        }
        let store = cookie_store::serde::json::load(BufReader::new(json.as_bytes())).map_err(
            |e| SessionError::Deserialize {
                context: context.to_string(),
                reason: e.to_string(),
            },
        )?;
        let key = self.session_context(&context);
        let mut state = lock(&self.state);
        let session = Session::with_store(key.clone(), store, self.clock.now(), state.proxy.clone());
        session.wipe_session_only_cookies();
        state.sessions.insert(key, Arc::new(session));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::DefaultDomainNormalizer;

    const T0: u64 = 1_700_000_000;

    fn manager() -> (Arc<ManualClock>, SessionManager) {
        let clock = Arc::new(ManualClock::new(T0));
        let manager = SessionManager::new(
            clock.clone(),
            Arc::new(DefaultDomainNormalizer),
            Duration::from_secs(3_600),
        );
        (clock, manager)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_subdomains_share_a_session() {
        let (_clock, manager) = manager();
        let a = manager.get_session(&NetworkContext::domain("a.example.com"));
        let b = manager.get_session(&NetworkContext::domain("b.example.com"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.context(), &NetworkContext::domain("example.com"));
    }

    #[test]
    fn test_service_never_merges_with_domain() {
        let (_clock, manager) = manager();
        let domain = manager.get_session(&NetworkContext::domain("example.com"));
        let service = manager.get_session(&NetworkContext::hydrus_service("example.com"));
        assert!(!Arc::ptr_eq(&domain, &service));
    }

    #[test]
    fn test_cookie_header_round_trip() {
        let (_clock, manager) = manager();
        let session = manager.get_session(&NetworkContext::domain("example.com"));
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, "sid=abc; Path=/".parse().unwrap());
        headers.append(SET_COOKIE, "theme=dark; Path=/".parse().unwrap());
        session.store_response_cookies(&headers, &url("https://example.com/login"));

        let header = session
            .cookie_header(&url("https://example.com/home"))
            .unwrap();
        assert!(header.contains("sid=abc"));
        assert!(header.contains("theme=dark"));
        assert!(session.cookie_header(&url("https://other.com/")).is_none());
    }

    #[test]
    fn test_idle_timeout_wipes_session_cookies_only() {
        let (clock, manager) = manager();
        let ctx = NetworkContext::domain("example.com");
        let site = url("https://example.com/");
        let session = manager.get_session(&ctx);
        session.add_cookie("sid=abc", &site);
        session.add_cookie("remember=1; Max-Age=31536000", &site);

        clock.advance(3_599);
        let session = manager.get_session(&ctx);
        assert!(session.has_cookie(&site, "sid"));

        clock.advance(3_600);
        let session = manager.get_session(&ctx);
        assert!(!session.has_cookie(&site, "sid"));
        assert!(session.has_cookie(&site, "remember"));
    }

    #[test]
    fn test_per_context_timeout_override() {
        let (clock, manager) = manager();
        let ctx = NetworkContext::hydrus_service("abcd");
        let site = url("http://127.0.0.1:45869/");
        manager.set_session_timeout(&ctx, Duration::from_secs(10));
        manager.get_session(&ctx).add_cookie("sid=1", &site);

        clock.advance(10);
        assert!(!manager.get_session(&ctx).has_cookie(&site, "sid"));
    }

    #[test]
    fn test_proxy_applied_on_next_access() {
        let (_clock, manager) = manager();
        let ctx = NetworkContext::domain("example.com");
        assert!(manager.get_session(&ctx).proxy().is_none());

        manager.set_proxy(Some(ProxySettings::new("http://proxy:3128")));
        let session = manager.get_session(&ctx);
        assert_eq!(session.proxy().unwrap().url, "http://proxy:3128");
    }

    #[test]
    fn test_clear_session() {
        let (_clock, manager) = manager();
        let ctx = NetworkContext::domain("example.com");
        let first = manager.get_session(&ctx);
        assert!(manager.clear_session(&NetworkContext::domain("www.example.com")));
        let second = manager.get_session(&ctx);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!manager.clear_session(&NetworkContext::domain("nothing.org")));
    }

    #[test]
    fn test_cookie_changes_mark_manager_dirty() {
        let (clock, manager) = manager();
        let site = url("https://example.com/");
        let session = manager.get_session(&NetworkContext::domain("example.com"));
        manager.mark_clean();

        let mut headers = HeaderMap::new();
        headers.insert(SET_COOKIE, "auth=1; Max-Age=600".parse().unwrap());
        session.store_response_cookies(&headers, &site);
        assert!(manager.is_dirty());
        manager.mark_clean();
        assert!(!session.is_dirty());

        session.add_cookie("not a cookie", &site);
        assert!(!manager.is_dirty());

        session.add_cookie("sid=abc", &site);
        manager.mark_clean();
        clock.advance(3_600);
        manager.get_session(&NetworkContext::domain("example.com"));
        assert!(manager.is_dirty());
    }

    #[test]
    fn test_serialization_keeps_only_persistent_cookies() {
        let (_clock, manager) = manager();
        let ctx = NetworkContext::domain("example.com");
        let site = url("https://example.com/");
        let session = manager.get_session(&ctx);
        session.add_cookie("sid=abc", &site);
        session.add_cookie("remember=1; Max-Age=31536000", &site);
        manager.get_session(&NetworkContext::ephemeral("tmp"));

        let saved = manager.persistent_sessions().unwrap();
        assert_eq!(saved.len(), 1);

        let (_clock, restored) = self::manager();
        restored.load_session(saved[0].0.clone(), &saved[0].1).unwrap();
        let session = restored.get_session(&ctx);
        assert!(session.has_cookie(&site, "remember"));
        assert!(!session.has_cookie(&site, "sid"));
    }
}
