//! Parallel Batch Processing
//!
//! Chunked fan-out of blocking work with chunk deadlines, retry with
//! exponential backoff and primary/fallback execution.

mod batch;
mod task;

pub use batch::{ParallelBatchProcessor, ProcessorStats};
pub use task::{TaskError, TaskId, TaskResult, TaskSnapshot};
