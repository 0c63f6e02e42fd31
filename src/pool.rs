//! Bounded Blocking Worker Pool
//!
//! Anything that blocks (disk I/O, caller-supplied fetch/process functions)
//! runs through [`WorkerPool::run_blocking`]. The orchestration layer never
//! calls blocking code directly.
//!
//! # Design
//!
//! - A semaphore bounds concurrent blocking jobs to `max_workers`
//! - The permit moves into the blocking closure, so capacity is only
//!   returned when the job really finishes, even if the awaiting task was
//!   cancelled
//! - `close()` rejects new work and waits for every in-flight job

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Error, Result};

/// Outcome of a blocking job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The pool was closed before the job could start
    Closed,
    /// The job panicked
    Panicked(String),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Closed => write!(f, "worker pool is closed"),
            JobError::Panicked(msg) => write!(f, "job panicked: {}", msg),
        }
    }
}

impl std::error::Error for JobError {}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Configured workers
    pub max_workers: usize,
    /// Workers currently running a job
    pub busy_workers: usize,
    /// Whether the pool still accepts work
    pub closed: bool,
}

/// Shared bounded pool for blocking work
#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    max_workers: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with `max_workers` concurrent jobs
    pub fn new(name: impl Into<String>, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        let name: String = name.into();
        Ok(Self {
            name: Arc::from(name.as_str()),
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
        })
    }

    /// Run `job` on a blocking thread once a worker is free
    pub async fn run_blocking<F, R>(&self, job: F) -> std::result::Result<R, JobError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| JobError::Closed)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        handle.await.map_err(|e| {
            if e.is_panic() {
                JobError::Panicked(panic_message(e.into_panic()))
            } else {
                JobError::Closed
            }
        })
    }

    /// Configured worker count
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers currently busy
    pub fn busy_workers(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_workers
            .saturating_sub(self.permits.available_permits())
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.to_string(),
            max_workers: self.max_workers,
            busy_workers: self.busy_workers(),
            closed: self.is_closed(),
        }
    }

    /// Wait for in-flight jobs, then reject all new work
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.permits.is_closed() {
            return;
        }
        let all = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        match self.permits.acquire_many(all).await {
            Ok(permits) => {
                self.permits.close();
                drop(permits);
            }
            Err(_) => {
                // Raced with another close
            }
        }
        debug!(pool = %self.name, "Worker pool closed");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("max_workers", &self.max_workers)
            .field("busy_workers", &self.busy_workers())
            .finish()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(WorkerPool::new("empty", 0), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let value = tokio_test::assert_ok!(pool.run_blocking(|| 21 * 2).await);
        assert_eq!(value, 42);
        assert_eq!(pool.busy_workers(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let err = tokio_test::assert_err!(pool.run_blocking(|| -> u32 { panic!("boom") }).await);
        assert_eq!(err, JobError::Panicked("boom".to_string()));
        // Capacity is returned after a panic
        assert_eq!(pool.run_blocking(|| 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..8).map(|_| {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                pool.run_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });
        futures::future::join_all(jobs).await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_close_rejects_new_work() {
        let pool = WorkerPool::new("closing", 2).unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.run_blocking(|| 1).await, Err(JobError::Closed));
        assert!(pool.stats().closed);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_jobs() {
        let pool = WorkerPool::new("draining", 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let job = {
            let pool = pool.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                pool.run_blocking(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        job.await.unwrap().unwrap();
    }
}
