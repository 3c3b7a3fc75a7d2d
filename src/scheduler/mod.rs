//! Time-based job scheduler and the worker pool it (and the network engine)
//! runs work on.
//!
//! A [`JobScheduler`] owns one coordinating task that sleeps until the
//! earliest due [`ScheduledJob`], an external wake, or shutdown. Due jobs run
//! on the [`WorkerPool`]; repeating jobs are put back with
//! `next_run_time = now + period` once their callable returns.

mod worker_pool;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use worker_pool::WorkerPool;

use crate::shutdown::Shutdown;

/// Result of one run of a scheduled callable.
pub type JobResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Work = Box<dyn Fn() -> BoxFuture<'static, JobResult> + Send + Sync>;

/// Links a job back to the scheduler it was registered with.
#[derive(Debug)]
struct SchedulerLink {
    wake: Arc<Notify>,
    dirty: Arc<AtomicBool>,
}

/// A callable with a due time and an optional repeat period.
pub struct ScheduledJob {
    name: String,
    work: Work,
    period: Option<Duration>,
    next_run: Mutex<Instant>,
    killed: AtomicBool,
    running: AtomicBool,
    link: OnceLock<SchedulerLink>,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("next_run", &self.next_run_time())
            .field("killed", &self.is_killed())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ScheduledJob {
    /// A job that runs once, `delay` from now.
    pub fn one_shot<F, Fut>(name: impl Into<String>, delay: Duration, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::new(name.into(), delay, None, work)
    }

    /// A job that first runs `delay` from now, then every `period` after each
    /// run returns.
    pub fn repeating<F, Fut>(
        name: impl Into<String>,
        delay: Duration,
        period: Duration,
        work: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::new(name.into(), delay, Some(period), work)
    }

    fn new<F, Fut>(name: String, delay: Duration, period: Option<Duration>, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self {
            name,
            work: Box::new(move || work().boxed()),
            period,
            next_run: Mutex::new(Instant::now() + delay),
            killed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            link: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    fn lock_next_run(&self) -> MutexGuard<'_, Instant> {
        self.next_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn next_run_time(&self) -> Instant {
        *self.lock_next_run()
    }

    /// Moves the due time and tells the scheduler to re-sort.
    pub fn set_next_run_time(&self, at: Instant) {
        *self.lock_next_run() = at;
        if let Some(link) = self.link.get() {
            link.dirty.store(true, Ordering::SeqCst);
            link.wake.notify_one();
        }
    }

    /// Makes the job due now.
    pub fn wake(&self) {
        self.set_next_run_time(Instant::now());
    }

    /// Stops all future runs. A run already in progress finishes.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(link) = self.link.get() {
            link.dirty.store(true, Ordering::SeqCst);
            link.wake.notify_one();
        }
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_due(&self, now: Instant) -> bool {
        self.next_run_time() <= now
    }

    async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        debug!(job = %self.name, "running scheduled job");
        let outcome = AssertUnwindSafe(async { (self.work)().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job = %self.name, error = %e, "scheduled job failed"),
            Err(_) => warn!(job = %self.name, "scheduled job panicked"),
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct WaitingSet {
    jobs: Vec<Arc<ScheduledJob>>,
    in_flight: usize,
}

#[derive(Debug)]
struct SchedulerInner {
    waiting: Mutex<WaitingSet>,
    dirty: Arc<AtomicBool>,
    wake: Arc<Notify>,
    workers: WorkerPool,
    shutdown: Shutdown,
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, WaitingSet> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, job: Arc<ScheduledJob>) {
        self.lock().jobs.push(job);
        self.dirty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Removes killed jobs, then takes every due one. Returns the due jobs and
    /// the earliest remaining due time.
    fn take_due(&self, now: Instant) -> (Vec<Arc<ScheduledJob>>, Option<Instant>) {
        let mut waiting = self.lock();
        if self.dirty.swap(false, Ordering::SeqCst) {
            waiting.jobs.retain(|job| !job.is_killed());
            waiting.jobs.sort_by_key(|job| job.next_run_time());
        }
        let split = waiting
            .jobs
            .iter()
            .position(|job| !job.is_due(now))
            .unwrap_or(waiting.jobs.len());
        let due: Vec<_> = waiting.jobs.drain(..split).collect();
        waiting.in_flight += due.len();
        let next = waiting.jobs.first().map(|job| job.next_run_time());
        (due, next)
    }

    fn finish(&self, job: Arc<ScheduledJob>) {
        self.lock().in_flight -= 1;
        let Some(period) = job.period else {
            return;
        };
        if job.is_killed() || self.shutdown.is_triggered() {
            return;
        }
        *job.lock_next_run() = Instant::now() + period;
        self.insert(job);
    }
}

/// Runs [`ScheduledJob`]s when they fall due.
#[derive(Debug)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Creates a stopped scheduler running at most `max_workers` jobs at once.
    #[must_use]
    pub fn new(max_workers: usize, shutdown: Shutdown) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                waiting: Mutex::new(WaitingSet::default()),
                dirty: Arc::new(AtomicBool::new(false)),
                wake: Arc::new(Notify::new()),
                workers: WorkerPool::new(max_workers),
                shutdown,
            }),
            task: Mutex::new(None),
        }
    }

    /// Adds a job. A job belongs to at most one scheduler.
    #[instrument(skip_all, fields(job = %job.name()))]
    pub fn register_job(&self, job: Arc<ScheduledJob>) {
        let _ = job.link.set(SchedulerLink {
            wake: Arc::clone(&self.inner.wake),
            dirty: Arc::clone(&self.inner.dirty),
        });
        debug!("registered scheduled job");
        self.inner.insert(job);
    }

    /// Re-sorts the waiting set and re-checks due times.
    pub fn work_times_have_changed(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Jobs waiting plus jobs running.
    #[must_use]
    pub fn job_count(&self) -> usize {
        let waiting = self.inner.lock();
        waiting.jobs.iter().filter(|job| !job.is_killed()).count() + waiting.in_flight
    }

    /// Spawns the scheduling task. Calling it twice has no effect.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run_scheduler(inner)));
        info!("job scheduler started");
    }

    /// Triggers the shared shutdown and waits for the scheduling task.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        info!("job scheduler stopped");
    }
}

async fn run_scheduler(inner: Arc<SchedulerInner>) {
    let wake = Arc::clone(&inner.wake);
    let shutdown = inner.shutdown.clone();

    loop {
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shutdown.is_triggered() {
            break;
        }
        let (due, next) = inner.take_due(Instant::now());
        for job in due {
            if job.is_killed() {
                inner.lock().in_flight -= 1;
                continue;
            }
            let workers = inner.workers.clone();
            let inner = Arc::clone(&inner);
            workers.spawn(async move {
                job.run().await;
                inner.finish(job);
            });
        }

        let sleep = async {
            match next {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = &mut notified => {}
            () = sleep => {}
            () = shutdown.wait() => {}
        }
    }
}
