//! Task Results and Registry
//!
//! Every item the processor runs is registered while in flight so it can be
//! listed in stats and cancelled individually.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifier of one in-flight task
pub type TaskId = u64;

/// Why a task produced no value
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskError {
    /// The process function returned an error
    #[error("task failed: {0}")]
    Failed(String),

    /// The process function panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The chunk deadline passed before the task finished
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The task was cancelled through `cancel_task`
    #[error("task cancelled")]
    Cancelled,

    /// The processor was shut down
    #[error("processor is shut down")]
    ShutDown,
}

/// Result of one item
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<T> {
    /// Position of the item in the submitted batch
    pub index: usize,
    pub outcome: Result<T, TaskError>,
    pub execution_time: Duration,
}

impl<T> TaskResult<T> {
    pub fn new(index: usize, outcome: Result<T, TaskError>, execution_time: Duration) -> Self {
        Self {
            index,
            outcome,
            execution_time,
        }
    }

    /// Check if the item produced a value
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Error of a failed item
    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    /// Value of a successful item
    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }
}

/// Point-in-time view of one registered task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    /// Position in its batch
    pub index: usize,
    pub running: bool,
    pub cancelled: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Registry entry for one task
#[derive(Debug)]
pub(crate) struct ActiveTask {
    index: usize,
    started_at: Instant,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    error: Mutex<Option<String>>,
}

impl ActiveTask {
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn finish(&self, error: Option<String>) {
        *self.error.lock() = error;
    }

    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            index: self.index,
            running: !*self.done.borrow(),
            cancelled: self.cancel.is_cancelled(),
            error: self.error.lock().clone(),
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// Completion signal held by the running task
#[derive(Debug)]
pub(crate) struct DoneSignal(watch::Sender<bool>);

impl DoneSignal {
    pub(crate) fn complete(self) {
        let _ = self.0.send(true);
    }
}

/// In-flight tasks keyed by id
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    next_id: AtomicU64,
    tasks: DashMap<TaskId, Arc<ActiveTask>>,
}

impl TaskRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a task whose token is a child of `parent`
    pub(crate) fn register(
        &self,
        index: usize,
        parent: &CancellationToken,
    ) -> (TaskId, Arc<ActiveTask>, DoneSignal) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(false);
        let task = Arc::new(ActiveTask {
            index,
            started_at: Instant::now(),
            cancel: parent.child_token(),
            done: rx,
            error: Mutex::new(None),
        });
        self.tasks.insert(id, Arc::clone(&task));
        (id, task, DoneSignal(tx))
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.tasks.remove(&id);
    }

    /// Cancel `id` and wait until it has terminated
    ///
    /// `false` when the task is unknown or already finished.
    pub(crate) async fn cancel(&self, id: TaskId) -> bool {
        let Some((token, mut done)) = self
            .tasks
            .get(&id)
            .map(|t| (t.cancel.clone(), t.done.clone()))
        else {
            return false;
        };
        if *done.borrow() {
            return false;
        }

        token.cancel();
        let _ = done.wait_for(|finished| *finished).await;
        true
    }

    /// Signal cancellation without waiting
    pub(crate) fn cancel_nowait(&self, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            task.cancel.cancel();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }
}

// =============================================================================
// Tests
// =============================================================================
