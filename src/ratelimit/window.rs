//! Fixed-window bucketing and counter key derivation.

use std::fmt;

/// Version tag embedded in every key. Bump it when the layout changes so
/// old and new processes never share counters with different meanings.
const KEY_VERSION: &str = "v1";

/// A fixed window that a timestamp falls into.
///
/// Window `k` covers the half-open interval
/// `[k * window_ms, (k + 1) * window_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    /// Index of the bucket since the epoch
    pub index: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Window {
    /// The window containing `now_ms`.
    ///
    /// `window_ms` must be positive; policies guarantee this at construction.
    pub fn containing(now_ms: u64, window_ms: u64) -> Self {
        Self {
            index: now_ms / window_ms,
            window_ms,
        }
    }

    /// Absolute epoch time at which the window ends and the next one begins.
    pub fn reset_at_ms(&self) -> u64 {
        self.index.saturating_add(1).saturating_mul(self.window_ms)
    }

    /// Counter lifetime: the window length rounded up to whole seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000)
    }
}

/// Identifies one counter in the store: a policy, a subject and a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey<'a> {
    pub prefix: &'a str,
    pub policy: &'a str,
    pub subject: &'a str,
    pub window: Window,
}

impl<'a> WindowKey<'a> {
    pub fn new(prefix: &'a str, policy: &'a str, subject: &'a str, window: Window) -> Self {
        Self {
            prefix,
            policy,
            subject,
            window,
        }
    }

    /// Render the store key.
    ///
    /// Format: `{prefix}:v1:{policy_len}:{policy}:{subject_len}:{subject}:{index}`.
    /// Both the policy and the subject are length-prefixed, so no choice of
    /// either can forge a key belonging to another policy, subject or window.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.prefix,
            KEY_VERSION,
            self.policy.len(),
            self.policy,
            self.subject.len(),
            self.subject,
            self.window.index
        )
    }
}

impl fmt::Display for WindowKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}

/// Derive the counter key for `subject` under `policy` at `now_ms`.
pub fn derive_key(prefix: &str, policy: &str, subject: &str, now_ms: u64, window_ms: u64) -> String {
    WindowKey::new(prefix, policy, subject, Window::containing(now_ms, window_ms)).to_store_key()
}
