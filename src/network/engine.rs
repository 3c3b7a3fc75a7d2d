//! The network engine: one coordinating task that moves jobs through
//! bandwidth admission, login gating and the download worker pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netjob_core::config::NetworkConfig;
//! use netjob_core::network::{NetworkEngine, NetworkJob, NetworkServices};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let services = NetworkServices::new(NetworkConfig::default())?;
//! let engine = NetworkEngine::start(services);
//! let job = Arc::new(NetworkJob::web_get("https://example.com/")?);
//! engine.add_job(Arc::clone(&job));
//! job.wait_until_done().await;
//! println!("{}", job.status().text);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::NetworkError;
use super::job::{JobKind, JobState, NetworkJob};
use super::login::{LoginPolicy, NoLoginRequired};
use super::pool::ConnectionPool;
use crate::bandwidth::BandwidthManager;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, NetworkConfig};
use crate::context::NetworkContext;
use crate::domain::{DefaultDomainNormalizer, DomainNormalizer};
use crate::scheduler::WorkerPool;
use crate::session::SessionManager;
use crate::shutdown::Shutdown;
use crate::units::duration_to_string;

/// Upper bound on how long a bandwidth-denied job sleeps before re-checking.
const MAX_BANDWIDTH_WAIT: Duration = Duration::from_secs(5);

/// How often idle transient trackers are dropped.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// Error type for engine construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Everything a job needs to run, shared by the engine, its workers and
/// login processes.
#[derive(Debug)]
pub struct NetworkServices {
    pub config: NetworkConfig,
    pub clock: Arc<dyn Clock>,
    pub bandwidth: Arc<BandwidthManager>,
    pub sessions: Arc<SessionManager>,
    pub pool: Arc<ConnectionPool>,
    pub login: Arc<dyn LoginPolicy>,
    pub normalizer: Arc<dyn DomainNormalizer>,
    pub shutdown: Shutdown,
}

impl NetworkServices {
    /// Builds the standard services on the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `config` is out of range.
    pub fn new(config: NetworkConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds the standard services on `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `config` is out of range.
    #[instrument(level = "debug", skip_all, fields(max_jobs = config.max_jobs))]
    pub fn with_clock(config: NetworkConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        config.validate()?;
        let normalizer: Arc<dyn DomainNormalizer> = Arc::new(DefaultDomainNormalizer);
        let bandwidth = Arc::new(
            BandwidthManager::new(Arc::clone(&clock))
                .with_politeness_delays(config.politeness_delays),
        );
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&clock),
            Arc::clone(&normalizer),
            config.session_idle_timeout(),
        ));
        sessions.set_proxy(config.proxy.clone());
        let pool = Arc::new(ConnectionPool::new(&config));
        debug!(
            request_timeout_secs = config.request_timeout_secs,
            max_redirects = config.max_redirects,
            "creating network services"
        );

        Ok(Self {
            config,
            clock,
            bandwidth,
            sessions,
            pool,
            login: Arc::new(NoLoginRequired),
            normalizer,
            shutdown: Shutdown::new(),
        })
    }

    #[must_use]
    pub fn with_login_policy(mut self, login: Arc<dyn LoginPolicy>) -> Self {
        self.login = login;
        self
    }

    /// Replaces the bandwidth manager, e.g. with one restored from disk.
    #[must_use]
    pub fn with_bandwidth(mut self, bandwidth: Arc<BandwidthManager>) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Shares an existing shutdown signal, e.g. with a scheduler.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Cheap handle for submitting jobs, handed to login processes.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::UnboundedSender<Arc<NetworkJob>>,
    wake: Arc<Notify>,
    services: Arc<NetworkServices>,
}

impl EngineHandle {
    /// Queues a job. After shutdown the job errors immediately.
    #[instrument(skip_all, fields(job = job.id(), url = %job.url()))]
    pub fn add_job(&self, job: Arc<NetworkJob>) {
        if self.services.shutdown.is_triggered() {
            job.fail(NetworkError::ShuttingDown);
            return;
        }
        job.attach_engine(Arc::clone(&self.wake));
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job) {
            job.fail(NetworkError::ShuttingDown);
            return;
        }
        self.wake.notify_one();
    }

    #[must_use]
    pub fn services(&self) -> &Arc<NetworkServices> {
        &self.services
    }
}

/// How many jobs sit in each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub bandwidth_throttled: usize,
    pub login_throttled: usize,
    pub ready: usize,
    pub downloading: usize,
}

impl EngineStatus {
    #[must_use]
    pub fn total(&self) -> usize {
        self.bandwidth_throttled + self.login_throttled + self.ready + self.downloading
    }
}

/// A running engine.
#[derive(Debug)]
pub struct NetworkEngine {
    handle: EngineHandle,
    status: Arc<Mutex<EngineStatus>>,
    coordinator: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl NetworkEngine {
    /// Spawns the coordinator and the connection reaper. Must be called
    /// inside a tokio runtime.
    #[instrument(skip_all, fields(max_jobs = services.config.max_jobs))]
    pub fn start(services: NetworkServices) -> Self {
        let services = Arc::new(services);
        let (sender, incoming) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let handle = EngineHandle {
            sender,
            wake: Arc::clone(&wake),
            services: Arc::clone(&services),
        };
        let status = Arc::new(Mutex::new(EngineStatus::default()));

        let reaper = services.pool.spawn_reaper(
            services.config.stale_connection_timeout() / 2,
            services.shutdown.clone(),
        );
        let coordinator = Coordinator {
            workers: WorkerPool::new(services.config.max_jobs),
            services,
            handle: handle.clone(),
            incoming,
            wake,
            status: Arc::clone(&status),
            bandwidth_queue: Vec::new(),
            login_queue: Vec::new(),
            ready: VecDeque::new(),
            downloading: Vec::new(),
            login: None,
            cooldowns: HashMap::new(),
            last_maintenance: Instant::now(),
        };
        let coordinator = tokio::spawn(coordinator.run());
        info!("network engine started");

        Self {
            handle,
            status,
            coordinator,
            reaper,
        }
    }

    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn services(&self) -> &Arc<NetworkServices> {
        self.handle.services()
    }

    /// See [`EngineHandle::add_job`].
    pub fn add_job(&self, job: Arc<NetworkJob>) {
        self.handle.add_job(job);
    }

    /// Job counts per stage as of the coordinator's last pass.
    #[must_use]
    pub fn status_counts(&self) -> EngineStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Triggers the shared shutdown signal and waits for the coordinator to
    /// error every queued job and for in-flight downloads to stop.
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        self.handle.services.shutdown.trigger();
        if let Err(e) = self.coordinator.await {
            warn!(error = %e, "engine coordinator ended abnormally");
        }
        if let Err(e) = self.reaper.await {
            warn!(error = %e, "connection reaper ended abnormally");
        }
        info!("network engine stopped");
    }
}

struct LoginSlot {
    context: NetworkContext,
    task: JoinHandle<Result<(), NetworkError>>,
}

struct Coordinator {
    services: Arc<NetworkServices>,
    handle: EngineHandle,
    incoming: mpsc::UnboundedReceiver<Arc<NetworkJob>>,
    wake: Arc<Notify>,
    status: Arc<Mutex<EngineStatus>>,
    workers: WorkerPool,
    bandwidth_queue: Vec<Arc<NetworkJob>>,
    login_queue: Vec<Arc<NetworkJob>>,
    ready: VecDeque<Arc<NetworkJob>>,
    downloading: Vec<(Arc<NetworkJob>, JoinHandle<()>)>,
    login: Option<LoginSlot>,
    cooldowns: HashMap<NetworkContext, Instant>,
    last_maintenance: Instant,
}

impl Coordinator {
    async fn run(mut self) {
        let wake = Arc::clone(&self.wake);
        let shutdown = self.services.shutdown.clone();
        let tick = self.services.config.engine_tick();

        loop {
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.drain_incoming();
            if shutdown.is_triggered() {
                break;
            }
            let now = Instant::now();
            self.process_bandwidth_queue(now);
            self.finish_login().await;
            self.process_login_queue(now);
            self.dispatch_ready();
            self.reap_workers().await;
            self.maintain(now);
            self.publish_status();

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(tick) => {}
                () = shutdown.wait() => {}
            }
        }

        self.drain_on_shutdown().await;
    }

    fn drain_incoming(&mut self) {
        while let Ok(job) = self.incoming.try_recv() {
            debug!(job = job.id(), "job queued");
            self.bandwidth_queue.push(job);
        }
    }

    fn process_bandwidth_queue(&mut self, now: Instant) {
        let tick = self.services.config.engine_tick();
        let mut waiting = Vec::with_capacity(self.bandwidth_queue.len());

        for job in std::mem::take(&mut self.bandwidth_queue) {
            if job.is_done() {
                continue;
            }
            if !job.is_awake(now) {
                waiting.push(job);
                continue;
            }

            let contexts = job.network_contexts();
            let admitted = if matches!(job.kind(), JobKind::Login) || job.is_bandwidth_overridden()
            {
                self.services.bandwidth.report_request_used(&contexts);
                true
            } else {
                self.services.bandwidth.try_to_start_request(&contexts)
            };

            if admitted {
                job.set_wake_time(None);
                if job.advance(JobState::LoginThrottled) {
                    debug!(job = job.id(), "bandwidth admitted");
                    job.set_status_text("checking login");
                    self.login_queue.push(job);
                }
                continue;
            }

            let (wait, context) = self
                .services
                .bandwidth
                .waiting_estimate_and_context(&contexts);
            let text = format!("waiting on bandwidth: {}", duration_to_string(wait.as_secs()));
            debug!(
                job = job.id(),
                context = ?context,
                wait_secs = wait.as_secs(),
                "bandwidth denied"
            );
            job.set_status_text(text);
            job.set_wake_time(Some(now + wait.max(tick).min(MAX_BANDWIDTH_WAIT.max(tick))));
            waiting.push(job);
        }

        self.bandwidth_queue = waiting;
    }

    async fn finish_login(&mut self) {
        let finished = self
            .login
            .as_ref()
            .is_some_and(|slot| slot.task.is_finished());
        if !finished {
            return;
        }
        let Some(slot) = self.login.take() else {
            return;
        };

        let failure = match slot.task.await {
            Ok(Ok(())) => {
                info!(context = %slot.context, "login finished");
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(join_error_message(e)),
        };
        if let Some(reason) = failure {
            warn!(context = %slot.context, %reason, "login failed, cooling down");
            self.cooldowns.insert(
                slot.context,
                Instant::now() + self.services.config.login_cooldown(),
            );
        }
        for job in &self.login_queue {
            job.set_wake_time(None);
        }
    }

    fn process_login_queue(&mut self, now: Instant) {
        let poll = self.services.config.login_poll();
        let mut waiting = Vec::with_capacity(self.login_queue.len());

        for job in std::mem::take(&mut self.login_queue) {
            if job.is_done() {
                continue;
            }
            if !job.is_awake(now) {
                waiting.push(job);
                continue;
            }

            let context = job.session_context(self.services.normalizer.as_ref());
            let needs_login = !matches!(job.kind(), JobKind::Login)
                && self.services.login.needs_login(&context, job.url().as_str());
            if !needs_login {
                job.set_wake_time(None);
                if job.advance(JobState::Ready) {
                    job.set_status_text("waiting for a download slot");
                    self.ready.push_back(job);
                }
                continue;
            }

            if let Some(&until) = self.cooldowns.get(&context)
                && until > now
            {
                job.set_status_text(format!(
                    "login cooling down: {}",
                    duration_to_string((until - now).as_secs())
                ));
                job.set_wake_time(Some(until));
                waiting.push(job);
                continue;
            }

            if let Some(slot) = &self.login {
                let text = if slot.context == context {
                    "logging in\u{2026}"
                } else {
                    "waiting on login"
                };
                job.set_status_text(text);
                job.set_wake_time(Some(now + poll));
                waiting.push(job);
                continue;
            }

            match self.services.login.can_login(&context) {
                Err(reason) => {
                    warn!(context = %context, %reason, "cannot log in");
                    let until = now + self.services.config.login_cooldown();
                    self.cooldowns.insert(context, until);
                    job.set_status_text(format!("cannot log in: {reason}"));
                    job.set_wake_time(Some(until.max(now + poll)));
                }
                Ok(()) => {
                    info!(context = %context, "starting login");
                    let mut process = self.services.login.generate_login_process(&context);
                    let handle = self.handle.clone();
                    let wake = Arc::clone(&self.wake);
                    let task = tokio::spawn(async move {
                        let result = process.start(handle).await;
                        wake.notify_one();
                        result
                    });
                    self.login = Some(LoginSlot { context, task });
                    job.set_status_text("logging in\u{2026}");
                    job.set_wake_time(Some(now + poll));
                }
            }
            waiting.push(job);
        }

        self.login_queue = waiting;
    }

    fn dispatch_ready(&mut self) {
        while self.downloading.len() < self.services.config.max_jobs {
            let Some(job) = self.ready.pop_front() else {
                break;
            };
            if !job.advance(JobState::Downloading) {
                continue;
            }
            debug!(job = job.id(), "dispatching to worker");
            job.set_status_text("starting download");

            let services = Arc::clone(&self.services);
            let worker_job = Arc::clone(&job);
            let task = self
                .workers
                .spawn(async move { worker_job.run(&services).await });
            self.downloading.push((job, task));
        }
    }

    async fn reap_workers(&mut self) {
        let mut running = Vec::with_capacity(self.downloading.len());
        for (job, task) in std::mem::take(&mut self.downloading) {
            if !task.is_finished() {
                running.push((job, task));
                continue;
            }
            if let Err(e) = task.await {
                let message = join_error_message(e);
                warn!(job = job.id(), %message, "worker panicked");
                job.fail(NetworkError::WorkerPanicked(message));
            }
        }
        self.downloading = running;
    }

    fn maintain(&mut self, now: Instant) {
        if now.duration_since(self.last_maintenance) < MAINTENANCE_INTERVAL {
            return;
        }
        self.last_maintenance = now;
        self.services.bandwidth.maintain();
        self.cooldowns.retain(|_, until| *until > now);
    }

    fn publish_status(&self) {
        let counts = EngineStatus {
            bandwidth_throttled: self.bandwidth_queue.len(),
            login_throttled: self.login_queue.len(),
            ready: self.ready.len(),
            downloading: self.downloading.len(),
        };
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = counts;
    }

    async fn drain_on_shutdown(&mut self) {
        info!(
            queued = self.bandwidth_queue.len() + self.login_queue.len() + self.ready.len(),
            downloading = self.downloading.len(),
            "engine shutting down"
        );
        self.incoming.close();
        self.drain_incoming();

        for job in self
            .bandwidth_queue
            .drain(..)
            .chain(self.login_queue.drain(..))
            .chain(self.ready.drain(..))
        {
            job.fail(NetworkError::ShuttingDown);
        }
        if let Some(slot) = self.login.take() {
            slot.task.abort();
        }
        for (job, task) in std::mem::take(&mut self.downloading) {
            if let Err(e) = task.await {
                job.fail(NetworkError::WorkerPanicked(join_error_message(e)));
            }
        }
        self.publish_status();
    }
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
