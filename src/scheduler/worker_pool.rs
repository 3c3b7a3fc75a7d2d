//! Bounded pool of tokio tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs futures as tasks, at most `capacity` at a time.
///
/// Tasks are spawned immediately and queue on the semaphore inside the task,
/// so `spawn` never blocks the caller.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Creates a pool. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently holding a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawns `work` once a slot frees up.
    ///
    /// A panic in `work` surfaces through the returned handle.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            // the semaphore is never closed
            let _permit = semaphore.acquire_owned().await.ok();
            let _slot = ActiveSlot::enter(active);
            work.await
        })
    }
}

/// Keeps the active count right even when the task panics.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn enter(active: Arc<AtomicUsize>) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active = now, "worker slot taken");
        Self(active)
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_capacity_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let peak = Arc::clone(&peak);
                let running = Arc::clone(&running);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_panic_releases_slot() {
        let pool = WorkerPool::new(1);
        let fail = true;
        let result = pool.spawn(async move { assert!(!fail, "boom") }).await;
        assert!(result.unwrap_err().is_panic());
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.spawn(async { 7 }).await.unwrap(), 7);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        assert_eq!(WorkerPool::new(0).capacity(), 1);
    }
}
