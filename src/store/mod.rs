//! Counter store clients.
//!
//! The counter store is the only state shared between server processes. It
//! needs exactly two operations: an atomic increment that creates missing keys
//! at 1, and a best-effort expiry.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Errors raised by a counter store client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Store command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic increment-with-expiry key/value store.
///
/// Implementations must serialize concurrent increments on the same key so
/// that each caller observes a distinct, consecutive post-increment value.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the new value.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Set the time-to-live of `key` in whole seconds.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Round trip to the store without touching any counter.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
