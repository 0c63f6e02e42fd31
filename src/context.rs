//! Process Context
//!
//! Built once at process start and passed by reference to every component
//! constructor. Holds what used to be process-wide state: the loaded
//! configuration, the shared blocking worker pool and the clock.

use std::sync::Arc;

use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::pool::WorkerPool;

/// Name of the shared blocking pool
pub const SHARED_POOL_NAME: &str = "blocking";

/// Explicit process context
#[derive(Clone)]
pub struct RuntimeContext {
    config: Arc<Config>,
    pool: WorkerPool,
    clock: SharedClock,
}

impl RuntimeContext {
    /// Validate `config` and build the shared pool with the system clock
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`RuntimeContext::new`] with an injected clock
    pub fn with_clock(config: Config, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(SHARED_POOL_NAME, config.parallel_processing.max_workers)?;
        Ok(Self {
            config: Arc::new(config),
            pool,
            clock,
        })
    }

    /// Loaded configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared blocking worker pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Clock used for TTLs and retention windows
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}
