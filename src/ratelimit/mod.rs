//! Fixed-window rate limiting.

mod backend;
mod limiter;
pub mod policy;
pub mod registry;
pub mod window;

pub use backend::AdmissionBackend;
pub use limiter::{now_ms, Decision, RateLimiter};
pub use policy::{Identity, Policy, RequestContext, SubjectKeyFn};
pub use registry::PolicyRegistry;
pub use window::{derive_key, Window, WindowKey};
