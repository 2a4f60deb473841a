//! Redis-backed counter store.
//!
//! One `RedisCounterStore` is created per process and shared by every policy.
//! It wraps a multiplexed [`ConnectionManager`], which pipelines concurrent
//! commands over a single connection and reconnects after I/O errors.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CounterStore, StoreError};
use crate::config::StoreConfig;
use crate::error::{Result, WardenError};

/// Counter store client talking to a Redis-compatible server.
pub struct RedisCounterStore {
    client: Client,
    /// Established connection, if any. Cloning a manager is cheap and every
    /// clone shares the same underlying connection.
    conn: RwLock<Option<ConnectionManager>>,
    /// Serializes reconnect attempts so an outage does not trigger one
    /// connect per in-flight request.
    connecting: Mutex<()>,
    command_timeout: Duration,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connected", &self.conn.read().is_some())
            .field("command_timeout", &self.command_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a client without connecting.
    ///
    /// Fails only if the URL cannot be parsed.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| WardenError::Config(format!("invalid store url '{}': {}", config.url, e)))?;

        Ok(Self {
            client,
            conn: RwLock::new(None),
            connecting: Mutex::new(()),
            command_timeout: config.command_timeout(),
            connect_timeout: config.connect_timeout(),
        })
    }

    /// Create a client and try to establish the connection eagerly.
    ///
    /// Makes up to `connect_attempts` attempts with jittered exponential
    /// backoff. If every attempt fails the store is still returned; it will
    /// keep trying to connect on later commands.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        let attempts = config.connect_attempts.max(1);

        for attempt in 1..=attempts {
            match store.connection().await {
                Ok(_) => {
                    info!(url = %config.url, attempt = attempt, "Connected to counter store");
                    return Ok(store);
                }
                Err(e) if attempt < attempts => {
                    let delay = backoff_delay(config.backoff_base_ms, attempt);
                    warn!(
                        error = %e,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Counter store connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempts = attempts,
                        "Counter store unreachable at startup, will reconnect on demand"
                    );
                }
            }
        }

        Ok(store)
    }

    async fn connection(&self) -> std::result::Result<ConnectionManager, StoreError> {
        let existing = self.conn.read().clone();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let _guard = self.connecting.lock().await;
        let existing = self.conn.read().clone();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        debug!("Opening counter store connection");
        let conn = self
            .bounded(self.connect_timeout, ConnectionManager::new(self.client.clone()))
            .await?;
        *self.conn.write() = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T, F>(&self, limit: Duration, fut: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> std::result::Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("INCR").arg(key).clone();
        self.bounded(self.command_timeout, cmd.query_async(&mut conn))
            .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> std::result::Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("EXPIRE").arg(key).arg(ttl_secs).clone();
        self.bounded(self.command_timeout, cmd.query_async(&mut conn))
            .await
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("PING");
        let _: String = self
            .bounded(self.command_timeout, cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }
}

/// Exponential backoff with up to one base interval of random jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(exp.saturating_add(jitter))
}
