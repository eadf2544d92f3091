//! Named rate limit policies and the registry that owns their limiters.
//!
//! A policy is a named `RateLimiterConfig`. The registry builds one limiter
//! per policy at startup and hands out shared references, replacing any
//! notion of process-global limiter instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::clock::{Clock, SystemClock};
use super::limiter::{RateLimiter, RateLimiterConfig};
use super::sweeper::Sweeper;
use crate::error::{Result, TurnstileError};

/// Policy guarding authentication endpoints.
pub const AUTH_POLICY: &str = "auth";
/// Policy guarding general API traffic.
pub const API_POLICY: &str = "api";

/// A set of named policy definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet {
    policies: BTreeMap<String, RateLimiterConfig>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new()
            .with_policy(AUTH_POLICY, RateLimiterConfig::new(5, Duration::from_secs(15 * 60)))
            .with_policy(API_POLICY, RateLimiterConfig::new(100, Duration::from_secs(60)))
    }
}

impl PolicySet {
    /// Create an empty policy set.
    pub fn new() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// Add or replace a policy.
    pub fn with_policy(mut self, name: impl Into<String>, config: RateLimiterConfig) -> Self {
        self.policies.insert(name.into(), config);
        self
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: PolicySet = serde_yaml::from_str(yaml)?;
        set.validate()?;
        Ok(set)
    }

    /// Check every policy definition.
    pub fn validate(&self) -> Result<()> {
        if self.policies.is_empty() {
            return Err(TurnstileError::Config(
                "at least one policy is required".to_string(),
            ));
        }
        for (name, config) in &self.policies {
            if name.is_empty() {
                return Err(TurnstileError::InvalidPolicy {
                    name: name.clone(),
                    reason: "policy name must not be empty".to_string(),
                });
            }
            config.validate().map_err(|reason| TurnstileError::InvalidPolicy {
                name: name.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Look up a policy definition.
    pub fn get(&self, name: &str) -> Option<&RateLimiterConfig> {
        self.policies.get(name)
    }

    /// Iterate over policies in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimiterConfig)> {
        self.policies.iter().map(|(name, config)| (name.as_str(), config))
    }

    /// Number of policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Snapshot of a policy for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    pub name: String,
    pub max_requests: u32,
    pub window_duration_ms: u64,
    pub max_tracked_identifiers: usize,
    pub tracked_identifiers: usize,
}

/// Owns one limiter per configured policy.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl PolicyRegistry {
    /// Build limiters on the system clock.
    pub fn from_policies(policies: &PolicySet) -> Result<Self> {
        Self::with_clock(policies, Arc::new(SystemClock))
    }

    /// Build limiters sharing an explicit clock.
    pub fn with_clock(policies: &PolicySet, clock: Arc<dyn Clock>) -> Result<Self> {
        policies.validate()?;

        let mut limiters = BTreeMap::new();
        for (name, config) in policies.iter() {
            let limiter = RateLimiter::with_clock(*config, clock.clone()).map_err(|e| {
                TurnstileError::InvalidPolicy {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
            info!(
                policy = %name,
                max_requests = config.max_requests,
                window_ms = config.window_duration_ms,
                max_tracked = config.max_tracked_identifiers,
                "Rate limit policy loaded"
            );
            limiters.insert(name.to_string(), Arc::new(limiter));
        }

        Ok(Self { limiters })
    }

    /// The limiter for `name`, if configured.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// The limiter for `name`, or an `UnknownPolicy` error.
    pub fn require(&self, name: &str) -> Result<Arc<RateLimiter>> {
        self.get(name)
            .ok_or_else(|| TurnstileError::UnknownPolicy(name.to_string()))
    }

    /// Configured policy names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// Per-policy monitoring snapshot.
    pub fn stats(&self) -> Vec<PolicyStats> {
        self.limiters
            .iter()
            .map(|(name, limiter)| {
                let config = limiter.config();
                PolicyStats {
                    name: name.clone(),
                    max_requests: config.max_requests,
                    window_duration_ms: config.window_duration_ms,
                    max_tracked_identifiers: config.max_tracked_identifiers,
                    tracked_identifiers: limiter.get_tracked_count(),
                }
            })
            .collect()
    }

    /// Start a cleanup sweeper for every policy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweepers(&self) -> Vec<Sweeper> {
        self.limiters
            .iter()
            .map(|(name, limiter)| Sweeper::spawn(name.clone(), limiter.clone()))
            .collect()
    }
}
