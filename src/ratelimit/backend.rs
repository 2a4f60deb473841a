//! Admission backend trait used by the HTTP layer.

use async_trait::async_trait;

use super::limiter::Decision;
use super::policy::RequestContext;
use crate::error::Result;

/// Trait for admission check implementations.
///
/// This abstracts over the concrete counter store behind a
/// [`RateLimiter`](super::RateLimiter) so the middleware can hold an
/// `Arc<dyn AdmissionBackend>`.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Run one admission check for `policy` against the request context.
    async fn check(&self, policy: &str, ctx: &RequestContext) -> Result<Decision>;

    /// Whether `policy` is registered.
    fn has_policy(&self, policy: &str) -> bool;

    /// Verify the counter store is reachable.
    async fn health(&self) -> Result<()>;
}
