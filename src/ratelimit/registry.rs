//! Named limiter policies.
//!
//! The registry is built once at startup and never mutated afterwards. Every
//! policy gets its own key space in the counter store because the policy name
//! is part of each counter key.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::policy::{by_identity_or_address, by_network_address, Policy, SubjectKeyFn};
use crate::config::PolicyOverride;
use crate::error::{Result, WardenError};

/// General API traffic.
pub const GENERAL: &str = "general";
/// Login, signup and other authentication endpoints.
pub const AUTH: &str = "auth";
/// AI content generation.
pub const AI_GENERATION: &str = "ai-generation";
/// Requests proxied to third-party APIs.
pub const THIRD_PARTY_PROXY: &str = "third-party-proxy";
/// File uploads.
pub const UPLOAD: &str = "upload";

const FIFTEEN_MINUTES_MS: u64 = 15 * 60 * 1000;
const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

/// Built-in policies: (name, window_ms, max_requests, subject key).
const DEFAULT_POLICIES: &[(&str, u64, u64, SubjectKeyFn)] = &[
    (GENERAL, FIFTEEN_MINUTES_MS, 100, by_network_address),
    (AUTH, FIFTEEN_MINUTES_MS, 5, by_network_address),
    (AI_GENERATION, ONE_HOUR_MS, 50, by_identity_or_address),
    (THIRD_PARTY_PROXY, FIFTEEN_MINUTES_MS, 300, by_identity_or_address),
    (UPLOAD, ONE_HOUR_MS, 20, by_identity_or_address),
];

/// Process-wide table of policy name to policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the five built-in policies.
    pub fn with_defaults() -> Result<Self> {
        Self::from_overrides(&HashMap::new())
    }

    /// Built-in policies with configured overrides applied.
    ///
    /// Names are normalised so `ai_generation` addresses `ai-generation`. An
    /// override for a name that is not built in defines a new network-address
    /// policy and must then carry both fields.
    pub fn from_overrides(overrides: &HashMap<String, PolicyOverride>) -> Result<Self> {
        let mut normalized: HashMap<String, &PolicyOverride> = HashMap::with_capacity(overrides.len());
        for (name, o) in overrides {
            let name = normalize_name(name);
            if normalized.contains_key(&name) {
                return Err(WardenError::invalid_policy(name, "configured more than once"));
            }
            normalized.insert(name, o);
        }
        let mut overrides = normalized;

        let mut registry = Self::new();

        for &(name, window_ms, max_requests, subject_key) in DEFAULT_POLICIES {
            let (window_ms, max_requests) = match overrides.remove(name) {
                Some(o) => (o.window_ms.unwrap_or(window_ms), o.max_requests.unwrap_or(max_requests)),
                None => (window_ms, max_requests),
            };
            registry.register(name, Policy::new(name, window_ms, max_requests, subject_key)?)?;
        }

        for (name, o) in overrides {
            let (Some(window_ms), Some(max_requests)) = (o.window_ms, o.max_requests) else {
                return Err(WardenError::invalid_policy(
                    name,
                    "custom policies need both window_ms and max_requests",
                ));
            };
            let policy = Policy::new(&name, window_ms, max_requests, by_network_address)?;
            registry.register(&name, policy)?;
        }

        info!(policies = registry.len(), "Policy registry initialized");
        Ok(registry)
    }

    /// Add a policy. Names must be unique, non-empty and limited to ASCII
    /// alphanumerics, `-` and `_`.
    pub fn register(&mut self, name: &str, policy: Policy) -> Result<()> {
        validate_name(name)?;
        if self.policies.contains_key(name) {
            return Err(WardenError::invalid_policy(name, "policy registered twice"));
        }

        debug!(
            policy = %name,
            window_ms = policy.window_ms(),
            max_requests = policy.max_requests(),
            "Registered policy"
        );
        self.policies.insert(name.to_string(), Arc::new(policy));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Policy>> {
        self.policies.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WardenError::invalid_policy(name, "name must not be empty"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(WardenError::invalid_policy(
            name,
            "name may only contain ASCII letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::RequestContext;

    fn override_of(window_ms: Option<u64>, max_requests: Option<u64>) -> PolicyOverride {
        PolicyOverride {
            window_ms,
            max_requests,
        }
    }

    #[test]
    fn test_default_policies() {
        let registry = PolicyRegistry::with_defaults().unwrap();

        assert_eq!(
            registry.names(),
            vec![AI_GENERATION, AUTH, GENERAL, THIRD_PARTY_PROXY, UPLOAD]
        );

        let expect = |name: &str, window_ms: u64, max_requests: u64| {
            let policy = registry.get(name).unwrap();
            assert_eq!(policy.window_ms(), window_ms, "{name} window");
            assert_eq!(policy.max_requests(), max_requests, "{name} quota");
        };
        expect(GENERAL, 900_000, 100);
        expect(AUTH, 900_000, 5);
        expect(AI_GENERATION, 3_600_000, 50);
        expect(THIRD_PARTY_PROXY, 900_000, 300);
        expect(UPLOAD, 3_600_000, 20);
    }

    #[test]
    fn test_default_subject_strategies() {
        let registry = PolicyRegistry::with_defaults().unwrap();
        let ctx = RequestContext::new(Some("192.168.1.7".parse().unwrap()), Some("carol".to_string()));

        assert_eq!(registry.get(GENERAL).unwrap().subject_key(&ctx), "192.168.1.7");
        assert_eq!(registry.get(AUTH).unwrap().subject_key(&ctx), "192.168.1.7");
        assert_eq!(registry.get(AI_GENERATION).unwrap().subject_key(&ctx), "user:carol");
        assert_eq!(registry.get(THIRD_PARTY_PROXY).unwrap().subject_key(&ctx), "user:carol");
        assert_eq!(registry.get(UPLOAD).unwrap().subject_key(&ctx), "user:carol");
    }

    #[test]
    fn test_overrides_applied() {
        let mut overrides = HashMap::new();
        overrides.insert("auth".to_string(), override_of(None, Some(10)));
        overrides.insert("AI_GENERATION".to_string(), override_of(Some(60_000), None));

        let registry = PolicyRegistry::from_overrides(&overrides).unwrap();

        let auth = registry.get(AUTH).unwrap();
        assert_eq!(auth.window_ms(), 900_000);
        assert_eq!(auth.max_requests(), 10);

        let ai = registry.get(AI_GENERATION).unwrap();
        assert_eq!(ai.window_ms(), 60_000);
        assert_eq!(ai.max_requests(), 50);
    }

    #[test]
    fn test_invalid_override_fails_fast() {
        let mut overrides = HashMap::new();
        overrides.insert("upload".to_string(), override_of(Some(0), None));

        let err = PolicyRegistry::from_overrides(&overrides).unwrap_err();
        assert!(matches!(err, WardenError::InvalidPolicy { policy, .. } if policy == UPLOAD));
    }

    #[test]
    fn test_custom_policy() {
        let mut overrides = HashMap::new();
        overrides.insert("webhooks".to_string(), override_of(Some(1_000), Some(3)));

        let registry = PolicyRegistry::from_overrides(&overrides).unwrap();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.get("webhooks").unwrap().max_requests(), 3);
    }

    #[test]
    fn test_incomplete_custom_policy_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("webhooks".to_string(), override_of(Some(1_000), None));

        assert!(matches!(
            PolicyRegistry::from_overrides(&overrides),
            Err(WardenError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn test_duplicate_override_spellings_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("ai_generation".to_string(), override_of(None, Some(1)));
        overrides.insert("ai-generation".to_string(), override_of(None, Some(999)));

        let err = PolicyRegistry::from_overrides(&overrides).unwrap_err();
        assert!(matches!(
            err,
            WardenError::InvalidPolicy { policy, reason }
                if policy == AI_GENERATION && reason == "configured more than once"
        ));
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let policy = Policy::new("x", 1_000, 1, by_network_address).unwrap();
        let mut registry = PolicyRegistry::new();

        assert!(registry.register("", policy).is_err());
        assert!(registry.register("a:b", policy).is_err());
        assert!(registry.register("ok", policy).is_ok());
        assert!(registry.register("ok", policy).is_err());
        assert!(registry.contains("ok"));
    }
}
