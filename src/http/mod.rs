//! HTTP admission adapter and server.

mod middleware;
mod server;

pub use middleware::{
    apply_quota_headers, request_context, RateLimitLayer, RateLimitService, RETRY_AFTER,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;
