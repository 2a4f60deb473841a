//! Core fixed-window rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, trace, warn};

use super::policy::{Policy, RequestContext};
use super::registry::PolicyRegistry;
use super::window::{Window, WindowKey};
use crate::config::StoreConfig;
use crate::error::{Result, WardenError};
use crate::store::CounterStore;

/// Outcome of one admission check.
///
/// The quota fields are filled in on both the allow and the deny path so
/// callers can always report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is within quota
    pub allowed: bool,
    /// Maximum requests per window
    pub limit: u64,
    /// Requests left in the current window, floored at zero
    pub remaining: u64,
    /// Epoch milliseconds at which the current window ends
    pub reset_at_ms: u64,
}

impl Decision {
    /// Window end in whole epoch seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Seconds a denied caller should wait, never less than one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// The core rate limiter.
///
/// Holds no lock of its own: the only shared state is the counter store,
/// whose atomic increment serializes concurrent checks on the same key.
pub struct RateLimiter<S: CounterStore> {
    store: Arc<S>,
    registry: PolicyRegistry,
    key_prefix: String,
    /// Set the counter expiry on a spawned task instead of inline.
    detach_expiry: bool,
}

impl<S: CounterStore + 'static> RateLimiter<S> {
    /// Create a limiter with default store settings.
    pub fn new(store: Arc<S>, registry: PolicyRegistry) -> Self {
        Self::with_config(store, registry, &StoreConfig::default())
    }

    /// Create a limiter using the key prefix and expiry mode from `config`.
    pub fn with_config(store: Arc<S>, registry: PolicyRegistry, config: &StoreConfig) -> Self {
        Self {
            store,
            registry,
            key_prefix: config.key_prefix.clone(),
            detach_expiry: config.detach_expiry,
        }
    }

    /// Admit or deny one request from `subject` under `policy` at `now_ms`.
    ///
    /// Store failures on the increment are returned as
    /// [`WardenError::StoreUnavailable`]; the caller chooses whether to fail
    /// open or closed. Failures setting the expiry are logged and dropped.
    pub async fn admit(
        &self,
        policy_name: &str,
        policy: &Policy,
        subject: &str,
        now_ms: u64,
    ) -> Result<Decision> {
        let window = Window::containing(now_ms, policy.window_ms());
        let key = WindowKey::new(&self.key_prefix, policy_name, subject, window).to_store_key();

        trace!(key = %key, policy = %policy_name, "Checking rate limit");

        let count = self.store.incr(&key).await?;

        if count == 1 {
            self.set_expiry(key.clone(), window.ttl_secs()).await;
        }

        let limit = policy.max_requests();
        let decision = Decision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_ms: window.reset_at_ms(),
        };

        if !decision.allowed {
            debug!(
                key = %key,
                policy = %policy_name,
                count = count,
                limit = limit,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Resolve `policy_name`, derive the subject from `ctx` and admit at the
    /// current wall-clock time.
    pub async fn check(&self, policy_name: &str, ctx: &RequestContext) -> Result<Decision> {
        let policy = self
            .registry
            .get(policy_name)
            .ok_or_else(|| WardenError::UnknownPolicy(policy_name.to_string()))?;
        let subject = policy.subject_key(ctx);

        self.admit(policy_name, policy, &subject, now_ms()).await
    }

    async fn set_expiry(&self, key: String, ttl_secs: u64) {
        if self.detach_expiry {
            let store = self.store.clone();
            tokio::spawn(async move {
                expire_best_effort(store.as_ref(), &key, ttl_secs).await;
            });
        } else {
            expire_best_effort(self.store.as_ref(), &key, ttl_secs).await;
        }
    }
}

/// Set a counter's expiry, logging instead of propagating failure. A missed
/// expiry only delays cleanup; it never lets a window exceed its quota.
async fn expire_best_effort<S: CounterStore + ?Sized>(store: &S, key: &str, ttl_secs: u64) {
    if let Err(e) = store.expire(key, ttl_secs).await {
        warn!(key = %key, ttl_secs = ttl_secs, error = %e, "Failed to set counter expiry");
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[async_trait]
impl<S: CounterStore + 'static> super::backend::AdmissionBackend for RateLimiter<S> {
    async fn check(&self, policy: &str, ctx: &RequestContext) -> Result<Decision> {
        RateLimiter::check(self, policy, ctx).await
    }

    fn has_policy(&self, policy: &str) -> bool {
        self.registry.contains(policy)
    }

    async fn health(&self) -> Result<()> {
        self.store.ping().await?;
        Ok(())
    }
}
