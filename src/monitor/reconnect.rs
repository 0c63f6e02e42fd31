//! Reconnect Seam
//!
//! The monitor drives the backoff schedule; what "reconnecting" means for a
//! particular upstream is supplied by the caller.

use async_trait::async_trait;

use crate::error::Result;

/// Re-establishes the connection to one data source
#[async_trait]
pub trait Reconnector: Send + Sync {
    /// One reconnect attempt; `Err` counts as a failed attempt
    async fn reconnect(&self, source: &str) -> Result<()>;
}

/// Default reconnector: every attempt succeeds
///
/// Sources without a real reconnect routine simply get their window cleared
/// after the first backoff delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReconnect;

#[async_trait]
impl Reconnector for AlwaysReconnect {
    async fn reconnect(&self, _source: &str) -> Result<()> {
        Ok(())
    }
}
