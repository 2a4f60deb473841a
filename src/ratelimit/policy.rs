//! Limiter policies and subject key derivation.

use std::fmt;
use std::net::IpAddr;

use crate::error::{Result, WardenError};

/// Subject used when a request carries neither identity nor address.
pub const UNKNOWN_SUBJECT: &str = "unknown";

/// Authenticated caller identity, attached to a request by upstream auth.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

/// What a policy may look at when deriving a subject key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller network address
    pub remote_addr: Option<IpAddr>,
    /// Resolved caller identity, if authentication ran
    pub identity: Option<String>,
}

impl RequestContext {
    pub fn new(remote_addr: Option<IpAddr>, identity: Option<String>) -> Self {
        Self {
            remote_addr,
            identity,
        }
    }
}

/// Maps a request to the key its quota is tracked against.
pub type SubjectKeyFn = fn(&RequestContext) -> String;

/// Track quota per caller network address.
pub fn by_network_address(ctx: &RequestContext) -> String {
    match ctx.remote_addr {
        Some(addr) => addr.to_string(),
        None => UNKNOWN_SUBJECT.to_string(),
    }
}

/// Track quota per authenticated identity, falling back to network address.
pub fn by_identity_or_address(ctx: &RequestContext) -> String {
    match ctx.identity.as_deref() {
        Some(id) if !id.is_empty() => format!("user:{}", id),
        _ => by_network_address(ctx),
    }
}

/// An immutable limiter configuration: at most `max_requests` per subject in
/// each fixed window of `window_ms` milliseconds.
#[derive(Clone, Copy)]
pub struct Policy {
    window_ms: u64,
    max_requests: u64,
    subject_key: SubjectKeyFn,
}

impl Policy {
    /// Create a policy, rejecting a zero window or quota.
    pub fn new(name: &str, window_ms: u64, max_requests: u64, subject_key: SubjectKeyFn) -> Result<Self> {
        if window_ms == 0 {
            return Err(WardenError::invalid_policy(name, "window_ms must be positive"));
        }
        if max_requests == 0 {
            return Err(WardenError::invalid_policy(name, "max_requests must be positive"));
        }

        Ok(Self {
            window_ms,
            max_requests,
            subject_key,
        })
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Derive the subject key for a request.
    pub fn subject_key(&self, ctx: &RequestContext) -> String {
        (self.subject_key)(ctx)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .finish_non_exhaustive()
    }
}
