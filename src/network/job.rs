//! A single network request and its lifecycle.
//!
//! Jobs are shared as `Arc<NetworkJob>` between the caller, the engine's
//! coordinator and the worker that performs the request. State only moves
//! forward; the terminal states (`Done`, `Errored`, `Cancelled`) never change
//! once reached.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, SERVER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::NetworkError;
use super::engine::NetworkServices;
use super::pool::RequestSpec;
use crate::bandwidth::{BandwidthMetric, BandwidthTracker};
use crate::clock::{Clock, SystemClock};
use crate::context::NetworkContext;
use crate::domain::{DomainNormalizer, applicable_domains};
use crate::shutdown::Shutdown;
use crate::units::{bytes_to_string, duration_to_string};

/// How often a download paused by bandwidth re-checks.
const CONTINUE_POLL: Duration = Duration::from_millis(250);

/// Remote error bodies are kept up to this many bytes.
const MAX_ERROR_BODY: usize = 4 * 1024;

/// Window the reported transfer speed is averaged over.
const SPEED_WINDOW_SECS: u64 = 4;

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// What a job talks to, which decides its contexts and checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// An ordinary web request.
    Web,
    /// A request to a remote service that reports its network version in the
    /// `Server` header.
    Service {
        service_key: String,
        service_type_name: String,
        network_version: u32,
    },
    /// A request issued by a login process.
    Login,
}

/// Where a job is in its lifecycle. Ordered: a job never moves to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    BandwidthThrottled,
    LoginThrottled,
    Ready,
    Downloading,
    Done,
    Errored,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BandwidthThrottled => "bandwidth throttled",
            Self::LoginThrottled => "login throttled",
            Self::Ready => "ready",
            Self::Downloading => "downloading",
            Self::Done => "done",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Snapshot of a job's progress for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub text: String,
    pub bytes_per_sec: u64,
    pub bytes_read: u64,
    pub bytes_expected: Option<u64>,
}

#[derive(Debug, Default)]
struct JobInner {
    status_text: String,
    error: Option<Arc<NetworkError>>,
    content: Option<Bytes>,
    wake_time: Option<Instant>,
    bytes_expected: Option<u64>,
    final_url: Option<Url>,
    tracker: BandwidthTracker,
}

/// One request.
pub struct NetworkJob {
    id: u64,
    kind: JobKind,
    spec: RequestSpec,
    destination: Option<PathBuf>,
    extra_contexts: Vec<NetworkContext>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<JobState>,
    inner: Mutex<JobInner>,
    cancel: Shutdown,
    bandwidth_override: AtomicBool,
    bytes_read: AtomicU64,
    engine_wake: OnceLock<Arc<Notify>>,
}

impl fmt::Debug for NetworkJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkJob")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("method", &self.spec.method)
            .field("url", &self.spec.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NetworkJob {
    /// Creates a job.
    #[must_use]
    pub fn new(kind: JobKind, method: Method, url: Url) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            spec: RequestSpec {
                method,
                url,
                body: None,
                referral_url: None,
                headers: HeaderMap::new(),
            },
            destination: None,
            extra_contexts: Vec::new(),
            clock: Arc::new(SystemClock),
            state: watch::Sender::new(JobState::BandwidthThrottled),
            inner: Mutex::new(JobInner {
                status_text: "waiting to start".to_string(),
                ..JobInner::default()
            }),
            cancel: Shutdown::new(),
            bandwidth_override: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            engine_wake: OnceLock::new(),
        }
    }

    /// A web GET.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidUrl`] if `url` does not parse.
    pub fn web_get(url: &str) -> Result<Self, NetworkError> {
        let url = Url::parse(url).map_err(|_| NetworkError::invalid_url(url))?;
        Ok(Self::new(JobKind::Web, Method::GET, url))
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.spec.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_referral_url(mut self, referral_url: impl Into<String>) -> Self {
        self.spec.referral_url = Some(referral_url.into());
        self
    }

    /// Streams the body to `path` instead of memory.
    #[must_use]
    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    /// Adds a context the job is also accounted against (a subscription, a page).
    #[must_use]
    pub fn with_extra_context(mut self, context: NetworkContext) -> Self {
        self.extra_contexts.push(context);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.spec.headers.insert(name, value);
        self
    }

    /// Clock used for the job's own speed tracker.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.spec.url
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.spec.method
    }

    #[must_use]
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host(&self) -> String {
        self.spec.url.host_str().unwrap_or("unknown").to_ascii_lowercase()
    }

    /// Every context this job's usage is accounted against.
    ///
    /// Web and login jobs: global, each domain from the host up to its
    /// registrable domain, and any extras. Service jobs: global, the service
    /// and any extras.
    #[must_use]
    pub fn network_contexts(&self) -> Vec<NetworkContext> {
        let mut contexts = vec![NetworkContext::global()];
        match &self.kind {
            JobKind::Web | JobKind::Login => {
                contexts.extend(
                    applicable_domains(&self.host())
                        .into_iter()
                        .map(NetworkContext::domain),
                );
            }
            JobKind::Service { service_key, .. } => {
                contexts.push(NetworkContext::hydrus_service(service_key.clone()));
            }
        }
        contexts.extend(self.extra_contexts.iter().cloned());
        contexts
    }

    /// The context whose session (and login) this job uses.
    #[must_use]
    pub fn session_context(&self, normalizer: &dyn DomainNormalizer) -> NetworkContext {
        match &self.kind {
            JobKind::Service { service_key, .. } => {
                NetworkContext::hydrus_service(service_key.clone())
            }
            JobKind::Web | JobKind::Login => {
                NetworkContext::domain(normalizer.second_level_domain(&self.host()))
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// The error the job ended with, if it errored.
    #[must_use]
    pub fn error(&self) -> Option<Arc<NetworkError>> {
        self.lock().error.clone()
    }

    /// The downloaded body, when it was kept in memory.
    #[must_use]
    pub fn content(&self) -> Option<Bytes> {
        self.lock().content.clone()
    }

    /// The URL the body came from, after redirects.
    #[must_use]
    pub fn final_url(&self) -> Option<Url> {
        self.lock().final_url.clone()
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        let now = self.clock.now();
        let inner = self.lock();
        let recent = inner.tracker.usage(
            BandwidthMetric::Data,
            Some(SPEED_WINDOW_SECS),
            now,
        );
        JobStatus {
            text: inner.status_text.clone(),
            bytes_per_sec: recent / SPEED_WINDOW_SECS,
            bytes_read: self.bytes_read.load(Ordering::SeqCst),
            bytes_expected: inner.bytes_expected,
        }
    }

    /// Requests cancellation. Queued jobs end at once; a downloading job ends
    /// at its next chunk.
    #[instrument(skip(self), fields(job = self.id))]
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        self.cancel.trigger();
        if self.state() != JobState::Downloading {
            self.finish(JobState::Cancelled, "cancelled!".to_string());
        }
        self.wake_engine();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_triggered()
    }

    /// Lets this job skip bandwidth admission. Its usage is still reported.
    pub fn override_bandwidth(&self) {
        self.bandwidth_override.store(true, Ordering::SeqCst);
        self.set_wake_time(None);
        self.wake_engine();
    }

    #[must_use]
    pub fn is_bandwidth_overridden(&self) -> bool {
        self.bandwidth_override.load(Ordering::SeqCst)
    }

    /// Waits for a terminal state and returns it.
    pub async fn wait_until_done(&self) -> JobState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub(crate) fn attach_engine(&self, wake: Arc<Notify>) {
        let _ = self.engine_wake.set(wake);
    }

    fn wake_engine(&self) {
        if let Some(wake) = self.engine_wake.get() {
            wake.notify_one();
        }
    }

    /// Moves to `to` if that is forward from the current state.
    pub(crate) fn advance(&self, to: JobState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || to <= *current {
                return false;
            }
            *current = to;
            true
        })
    }

    /// Updates the status line of a job that has not finished yet.
    pub(crate) fn set_status_text(&self, text: impl Into<String>) {
        let mut inner = self.lock();
        if !self.state().is_terminal() {
            inner.status_text = text.into();
        }
    }

    pub(crate) fn set_wake_time(&self, wake: Option<Instant>) {
        self.lock().wake_time = wake;
    }

    pub(crate) fn is_awake(&self, now: Instant) -> bool {
        self.lock().wake_time.is_none_or(|wake| wake <= now)
    }

    /// Moves to a terminal state. Text and error are written under the same
    /// lock so a waiter never sees the new state with stale text.
    fn finish_with(&self, state: JobState, text: String, error: Option<NetworkError>) {
        let finished = {
            let mut inner = self.lock();
            if self.state().is_terminal() {
                false
            } else {
                inner.status_text = text;
                inner.error = error.map(Arc::new);
                self.advance(state)
            }
        };
        if finished {
            self.wake_engine();
        }
    }

    fn finish(&self, state: JobState, text: String) {
        self.finish_with(state, text, None);
    }

    /// Ends the job with `error`. Cancellation is recorded as `Cancelled`.
    pub(crate) fn fail(&self, error: NetworkError) {
        if matches!(error, NetworkError::Cancelled) {
            self.finish(JobState::Cancelled, "cancelled!".to_string());
            return;
        }
        debug!(job = self.id, error = %error, "job errored");
        self.finish_with(JobState::Errored, error.status_text(), Some(error));
    }

    /// Performs the request. Called by the engine's worker once the job is
    /// `Downloading`.
    #[instrument(skip_all, fields(job = self.id, url = %self.spec.url))]
    pub(crate) async fn run(&self, services: &NetworkServices) {
        match self.execute(services).await {
            Ok(()) => {
                let read = self.bytes_read.load(Ordering::SeqCst);
                info!(bytes = read, "job done");
                self.finish(JobState::Done, "done!".to_string());
            }
            Err(error) => self.fail(error),
        }
    }

    async fn interruptible<T>(
        &self,
        services: &NetworkServices,
        future: impl Future<Output = T>,
    ) -> Result<T, NetworkError> {
        tokio::select! {
            value = future => Ok(value),
            () = self.cancel.wait() => Err(NetworkError::Cancelled),
            () = services.shutdown.wait() => Err(NetworkError::ShuttingDown),
        }
    }

    fn check_interrupted(&self, services: &NetworkServices) -> Result<(), NetworkError> {
        if self.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        if services.shutdown.is_triggered() {
            return Err(NetworkError::ShuttingDown);
        }
        Ok(())
    }

    async fn execute(&self, services: &NetworkServices) -> Result<(), NetworkError> {
        let session_context = self.session_context(services.normalizer.as_ref());
        let session = services.sessions.get_session(&session_context);
        let contexts = self.network_contexts();
        let mut backoff_retries = 0;

        loop {
            self.check_interrupted(services)?;
            self.set_status_text("sending request");
            let pooled = self
                .interruptible(services, services.pool.request(&self.spec, &session))
                .await??;

            let status = pooled.response.status();
            if !status.is_success() {
                let code = status.as_u16();
                let retry_after = pooled
                    .response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                if let Some(delay) = retry_after
                    && matches!(code, 429 | 503)
                    && self.spec.method.is_idempotent()
                    && backoff_retries < services.config.max_server_backoff_retries
                {
                    drop(pooled);
                    backoff_retries += 1;
                    warn!(
                        status = code,
                        delay_secs = delay.as_secs(),
                        attempt = backoff_retries,
                        "server asked to back off"
                    );
                    services
                        .bandwidth
                        .record_server_backoff(&self.host(), delay);
                    self.set_status_text(format!(
                        "server busy, retrying in {}",
                        duration_to_string(delay.as_secs())
                    ));
                    self.interruptible(services, tokio::time::sleep(delay))
                        .await?;
                    services.bandwidth.report_request_used(&contexts);
                    continue;
                }

                let (response, _guard) = pooled.into_parts();
                let body = read_error_body(response).await;
                return Err(NetworkError::remote_status(code, body));
            }

            if let JobKind::Service {
                service_type_name,
                network_version,
                ..
            } = &self.kind
            {
                check_server_version(
                    pooled.response.headers(),
                    service_type_name,
                    *network_version,
                )?;
            }

            self.lock().final_url = Some(pooled.final_url.clone());
            let (response, guard) = pooled.into_parts();
            let result = self.stream_body(services, &contexts, response).await;
            drop(guard);
            return result;
        }
    }

    async fn stream_body(
        &self,
        services: &NetworkServices,
        contexts: &[NetworkContext],
        response: reqwest::Response,
    ) -> Result<(), NetworkError> {
        let url = self.spec.url.as_str().to_string();
        let expected = response.content_length();
        self.lock().bytes_expected = expected;

        let mut sink = match &self.destination {
            Some(path) => {
                let file = File::create(path)
                    .await
                    .map_err(|e| NetworkError::io(path, e))?;
                Sink::File(BufWriter::with_capacity(services.config.chunk_size, file))
            }
            None => Sink::Memory(BytesMut::with_capacity(
                expected
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(0)
                    .min(services.config.chunk_size * 16),
            )),
        };

        let mut stream = response.bytes_stream();
        let mut read: u64 = 0;
        loop {
            while !services.bandwidth.can_continue_download(contexts) {
                self.check_interrupted(services)?;
                self.set_status_text("waiting on bandwidth to continue");
                self.interruptible(services, tokio::time::sleep(CONTINUE_POLL))
                    .await?;
            }

            let Some(chunk) = self.interruptible(services, stream.next()).await? else {
                break;
            };
            let chunk = chunk.map_err(|e| NetworkError::transport(url.as_str(), &e))?;
            let len = chunk.len() as u64;
            read += len;
            check_body_length(url.as_str(), read, expected)?;

            sink.write(&chunk, self.destination.as_deref()).await?;
            self.bytes_read.store(read, Ordering::SeqCst);
            services.bandwidth.report_data_used(contexts, len);
            let text = match expected {
                Some(total) => format!(
                    "downloading {}/{}",
                    bytes_to_string(read),
                    bytes_to_string(total)
                ),
                None => format!("downloading {}", bytes_to_string(read)),
            };
            let now = self.clock.now();
            {
                let mut inner = self.lock();
                inner.tracker.report_data_used(now, len);
                inner.status_text = text;
            }
        }

        match sink {
            Sink::File(mut writer) => {
                let path = self.destination.clone().unwrap_or_default();
                writer
                    .flush()
                    .await
                    .map_err(|e| NetworkError::io(&path, e))?;
            }
            Sink::Memory(buffer) => {
                self.lock().content = Some(buffer.freeze());
            }
        }
        Ok(())
    }
}

enum Sink {
    File(BufWriter<File>),
    Memory(BytesMut),
}

impl Sink {
    async fn write(&mut self, chunk: &[u8], path: Option<&Path>) -> Result<(), NetworkError> {
        match self {
            Sink::File(writer) => writer
                .write_all(chunk)
                .await
                .map_err(|e| NetworkError::io(path.unwrap_or(Path::new("")), e)),
            Sink::Memory(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
        }
    }
}

async fn read_error_body(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(MAX_ERROR_BODY);
    String::from_utf8_lossy(&body).into_owned()
}

/// Compares a `Server: <name>/<version>` header against our network version.
///
/// A missing header, or one naming a different service type, is not checked.
///
/// # Errors
///
/// Returns [`NetworkError::VersionMismatch`] naming the outdated side.
pub fn check_server_version(
    headers: &HeaderMap,
    service_type_name: &str,
    network_version: u32,
) -> Result<(), NetworkError> {
    let Some(server) = headers.get(SERVER).and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };
    let marker = format!("{service_type_name}/");
    let Some(remote) = server
        .find(&marker)
        .map(|at| &server[at + marker.len()..])
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse::<u32>().ok())
    else {
        return Ok(());
    };

    match remote.cmp(&network_version) {
        std::cmp::Ordering::Equal => Ok(()),
        std::cmp::Ordering::Greater => Err(NetworkError::VersionMismatch(format!(
            "Your client is outdated: the server is at network version {remote}, you are at \
             {network_version}. Please update."
        ))),
        std::cmp::Ordering::Less => Err(NetworkError::VersionMismatch(format!(
            "The server is outdated: it is at network version {remote}, you are at \
             {network_version}. The server needs updating."
        ))),
    }
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Capped at one hour. Returns `None` when unparseable.
///
/// ```
/// use std::time::Duration;
/// use netjob_core::network::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("99999"), Some(Duration::from_secs(3600)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();
    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }
    let date = httpdate::parse_http_date(header_value).ok()?;
    Some(
        date.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO)
            .min(MAX_RETRY_AFTER),
    )
}

/// Fails once more bytes arrived than the response's `Content-Length` declared.
fn check_body_length(url: &str, read: u64, expected: Option<u64>) -> Result<(), NetworkError> {
    match expected {
        Some(expected) if read > expected => Err(NetworkError::protocol_violation(
            url,
            format!("received {read} bytes, Content-Length was {expected}"),
        )),
        _ => Ok(()),
    }
}
