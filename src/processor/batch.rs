//! Parallel Batch Processor
//!
//! Splits a batch into chunks and runs every item through a caller-supplied
//! blocking function on the shared worker pool.
//!
//! ```text
//! items ──► chunk 0 ─┬─► item ─► WorkerPool ─┐
//!       │            └─► item ─► WorkerPool ─┤  chunk deadline
//!       └─► chunk 1 ─┬─► item ─► WorkerPool ─┤  (unfinished → Timeout)
//!                    └─► ...                 ┘
//!                                            ▼
//!                              Vec<TaskResult> ordered by index
//! ```
//!
//! Chunks run concurrently; items inside a chunk run concurrently up to the
//! pool's worker limit. Every item produces exactly one [`TaskResult`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::task::{TaskError, TaskId, TaskRegistry, TaskResult, TaskSnapshot};
use crate::config::ParallelSettings;
use crate::context::RuntimeContext;
use crate::pool::{JobError, PoolStats, WorkerPool};
use crate::retry::BackoffPolicy;

/// Processor statistics
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorStats {
    /// Tasks registered and not yet collected
    pub active_tasks: usize,
    pub pool: PoolStats,
    /// Workers free to take a job
    pub available_workers: usize,
    pub tasks: Vec<TaskSnapshot>,
    pub shut_down: bool,
}

/// Chunked fan-out over the shared worker pool
pub struct ParallelBatchProcessor {
    settings: ParallelSettings,
    pool: WorkerPool,
    registry: Arc<TaskRegistry>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ParallelBatchProcessor {
    /// Build a processor from the `parallel_processing` section
    pub fn new(ctx: &RuntimeContext) -> Arc<Self> {
        Arc::new(Self {
            settings: ctx.config().parallel_processing.clone(),
            pool: ctx.pool().clone(),
            registry: Arc::new(TaskRegistry::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `process` over every item
    ///
    /// `chunk_size` and `timeout` default to the configured values. The
    /// result vector is ordered by item index.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn process_batch<I, T, E, F>(
        &self,
        items: Vec<I>,
        process: F,
        chunk_size: Option<usize>,
        timeout: Option<Duration>,
    ) -> Vec<TaskResult<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
    {
        if self.is_shut_down() {
            return (0..items.len())
                .map(|index| TaskResult::new(index, Err(TaskError::ShutDown), Duration::ZERO))
                .collect();
        }

        let chunk_size = chunk_size
            .filter(|&n| n > 0)
            .unwrap_or(self.settings.chunk_size);
        let timeout = timeout.unwrap_or_else(|| self.settings.timeout());
        let process = Arc::new(process);

        let mut chunks: Vec<Vec<(usize, I)>> = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            if index % chunk_size == 0 {
                chunks.push(Vec::with_capacity(chunk_size));
            }
            if let Some(chunk) = chunks.last_mut() {
                chunk.push((index, item));
            }
        }
        let chunk_count = chunks.len();

        let runs = chunks
            .into_iter()
            .map(|chunk| self.run_chunk(chunk, Arc::clone(&process), timeout));
        let mut results: Vec<TaskResult<T>> = join_all(runs).await.into_iter().flatten().collect();
        results.sort_by_key(|r| r.index);

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            chunks = chunk_count,
            succeeded = results.len() - failed,
            failed,
            "Batch processed"
        );
        results
    }

    /// Run `process` up to `max_retries` times with exponential backoff
    ///
    /// The delay before retry `n` is `retry_delay * 2^(n-1)`. Execution
    /// times of all attempts are summed; the last failure is reported.
    pub async fn process_with_retry<I, T, E, F>(
        &self,
        item: I,
        process: F,
        max_retries: u32,
        retry_delay: Duration,
    ) -> TaskResult<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
    {
        let attempts = max_retries.max(1);
        let backoff = BackoffPolicy::uncapped(retry_delay, attempts);
        let process = Arc::new(process);
        let mut total = Duration::ZERO;

        let mut attempt = 1;
        loop {
            let result = self.run_one(item.clone(), Arc::clone(&process)).await;
            total += result.execution_time;

            let retryable = matches!(
                result.outcome,
                Err(TaskError::Failed(_)) | Err(TaskError::Panicked(_)) | Err(TaskError::Timeout(_))
            );
            if !retryable || attempt >= attempts {
                if let Err(e) = &result.outcome {
                    warn!(attempts = attempt, error = %e, "Task failed after retries");
                }
                return TaskResult::new(0, result.outcome, total);
            }

            let delay = backoff.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying task");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return TaskResult::new(0, Err(TaskError::ShutDown), total);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Run `primary`, and `fallback` once if it fails
    ///
    /// Execution times are summed; when both fail the fallback's failure is
    /// reported.
    pub async fn process_with_fallback<I, T, E1, E2, F, G>(
        &self,
        item: I,
        primary: F,
        fallback: G,
    ) -> TaskResult<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        E1: std::fmt::Display + Send + 'static,
        E2: std::fmt::Display + Send + 'static,
        F: Fn(I) -> Result<T, E1> + Send + Sync + 'static,
        G: Fn(I) -> Result<T, E2> + Send + Sync + 'static,
    {
        let first = self.run_one(item.clone(), Arc::new(primary)).await;
        let primary_failed = matches!(
            first.outcome,
            Err(TaskError::Failed(_)) | Err(TaskError::Panicked(_)) | Err(TaskError::Timeout(_))
        );
        if !primary_failed {
            return first;
        }
        if let Err(e) = &first.outcome {
            debug!(error = %e, "Primary failed, running fallback");
        }

        let second = self.run_one(item, Arc::new(fallback)).await;
        if let Err(e) = &second.outcome {
            warn!(error = %e, "Primary and fallback both failed");
        }
        TaskResult::new(0, second.outcome, first.execution_time + second.execution_time)
    }

    /// Cancel one in-flight task and wait for it to terminate
    ///
    /// `false` when the id is unknown or the task already finished.
    pub async fn cancel_task(&self, id: TaskId) -> bool {
        let cancelled = self.registry.cancel(id).await;
        if cancelled {
            info!(task_id = id, "Task cancelled");
        }
        cancelled
    }

    /// Cancel every in-flight task, wait for them and refuse new work
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight = self.registry.len();
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(cancelled = in_flight, "Batch processor shut down");
    }

    /// Check if `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Active tasks and pool usage
    pub fn stats(&self) -> ProcessorStats {
        let pool = self.pool.stats();
        ProcessorStats {
            active_tasks: self.registry.len(),
            available_workers: pool.max_workers.saturating_sub(pool.busy_workers),
            pool,
            tasks: self.registry.snapshots(),
            shut_down: self.is_shut_down(),
        }
    }

    /// Configured worker count
    pub fn max_workers(&self) -> usize {
        self.pool.max_workers()
    }

    async fn run_one<I, T, E, F>(&self, item: I, process: Arc<F>) -> TaskResult<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
    {
        if self.is_shut_down() {
            return TaskResult::new(0, Err(TaskError::ShutDown), Duration::ZERO);
        }
        let mut results = self
            .run_chunk(vec![(0, item)], process, self.settings.timeout())
            .await;
        results
            .pop()
            .unwrap_or_else(|| TaskResult::new(0, Err(TaskError::Cancelled), Duration::ZERO))
    }

    async fn run_chunk<I, T, E, F>(
        &self,
        chunk: Vec<(usize, I)>,
        process: Arc<F>,
        timeout: Duration,
    ) -> Vec<TaskResult<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
    {
        let mut results = Vec::with_capacity(chunk.len());
        let mut pending: HashMap<usize, TaskId> = HashMap::with_capacity(chunk.len());
        let mut set = JoinSet::new();

        for (index, item) in chunk {
            let (id, task, done) = self.registry.register(index, &self.shutdown);
            pending.insert(index, id);

            let pool = self.pool.clone();
            let process = Arc::clone(&process);
            let shutdown = self.shutdown.clone();
            let token = task.cancel_token().clone();

            set.spawn(self.tasks.track_future(async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    _ = token.cancelled() => {
                        if shutdown.is_cancelled() {
                            Err(TaskError::ShutDown)
                        } else {
                            Err(TaskError::Cancelled)
                        }
                    }
                    joined = pool.run_blocking(move || process(item)) => match joined {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(TaskError::Failed(e.to_string())),
                        Err(JobError::Panicked(msg)) => Err(TaskError::Panicked(msg)),
                        Err(JobError::Closed) => Err(TaskError::ShutDown),
                    },
                };
                task.finish(outcome.as_ref().err().map(|e| e.to_string()));
                done.complete();
                (index, outcome, started.elapsed())
            }));
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            let joined = if timed_out {
                set.join_next().await
            } else {
                tokio::select! {
                    joined = set.join_next() => joined,
                    _ = &mut deadline => {
                        timed_out = true;
                        warn!(
                            unfinished = pending.len(),
                            timeout_ms = timeout.as_millis() as u64,
                            "Chunk timed out, cancelling unfinished items"
                        );
                        for id in pending.values() {
                            self.registry.cancel_nowait(*id);
                        }
                        continue;
                    }
                }
            };

            let Some(joined) = joined else { break };
            match joined {
                Ok((index, outcome, elapsed)) => {
                    if let Some(id) = pending.remove(&index) {
                        self.registry.remove(id);
                    }
                    let result = match outcome {
                        Err(TaskError::Cancelled) if timed_out => {
                            TaskResult::new(index, Err(TaskError::Timeout(timeout)), timeout)
                        }
                        outcome => TaskResult::new(index, outcome, elapsed),
                    };
                    results.push(result);
                }
                Err(e) => warn!(error = %e, "Task wrapper failed"),
            }
        }

        // Items whose wrapper itself failed still get a result
        for (index, id) in pending {
            self.registry.remove(id);
            results.push(TaskResult::new(
                index,
                Err(TaskError::Panicked("task wrapper aborted".into())),
                Duration::ZERO,
            ));
        }
        results
    }
}

// =============================================================================
// Tests
// =============================================================================
