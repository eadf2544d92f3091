//! Core rate limiter implementation.
//!
//! A fixed-window counter per identifier. Bursts of up to twice the limit are
//! possible across a window boundary (the tail of one window plus the head of
//! the next); this limiter guards against abuse, not for precise fairness.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock, Timestamp};
use super::entry::RateLimitEntry;
use crate::error::{Result, TurnstileError};

/// Fraction of the tracked-identifier cap dropped per eviction pass.
const EVICTION_FRACTION: f64 = 0.1;

/// Immutable configuration for a single limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_duration_ms: u64,
    /// Upper bound on identifiers tracked at once
    #[serde(default = "default_max_tracked_identifiers")]
    pub max_tracked_identifiers: usize,
}

fn default_max_tracked_identifiers() -> usize {
    10_000
}

impl RateLimiterConfig {
    /// Create a configuration with the default identifier cap.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_duration_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_tracked_identifiers: default_max_tracked_identifiers(),
        }
    }

    /// Override the tracked-identifier cap.
    pub fn with_max_tracked_identifiers(mut self, max: usize) -> Self {
        self.max_tracked_identifiers = max;
        self
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// Check that every field is positive.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_requests == 0 {
            return Err("max_requests must be positive".to_string());
        }
        if self.window_duration_ms == 0 {
            return Err("window_duration_ms must be positive".to_string());
        }
        if self.max_tracked_identifiers == 0 {
            return Err("max_tracked_identifiers must be positive".to_string());
        }
        Ok(())
    }

    /// Entries removed per eviction pass.
    fn eviction_batch(&self) -> usize {
        ((self.max_tracked_identifiers as f64 * EVICTION_FRACTION) as usize).max(1)
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The per-window ceiling
    pub limit: u32,
    /// Quota left in the current window after this request
    pub remaining: u32,
    /// When the current window resets (ms since epoch)
    pub reset_at: Timestamp,
}

impl Decision {
    /// Time until the window resets, rounded up to whole seconds and never
    /// below one second. Suitable for a `Retry-After` header.
    pub fn retry_after(&self, now: Timestamp) -> Duration {
        let wait_ms = self.reset_at.saturating_sub(now);
        Duration::from_secs(wait_ms.div_ceil(1_000).max(1))
    }
}

/// Fixed-window rate limiter keyed by caller identifier.
///
/// Thread-safe: all state lives behind one lock, so checks for the same
/// identifier are serialised and the limit is exact within this process.
/// Separate processes each hold their own state.
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, RateLimitEntry>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked", &self.get_tracked_count())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter on an explicit clock.
    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().map_err(TurnstileError::Config)?;
        Ok(Self {
            config,
            clock,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Current time according to this limiter's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Decide whether a request from `identifier` may proceed.
    ///
    /// Any string is accepted, including the empty string.
    pub fn is_allowed(&self, identifier: &str) -> bool {
        self.check(identifier).allowed
    }

    /// Record a request from `identifier` and report the resulting quota.
    pub fn check(&self, identifier: &str) -> Decision {
        let now = self.clock.now();
        let limit = self.config.max_requests;
        let mut entries = self.entries.write();

        trace!(identifier_len = identifier.len(), "Checking rate limit");

        if let Some(entry) = entries.get_mut(identifier) {
            if !entry.is_expired(now) {
                let allowed = entry.record(now, limit);
                if !allowed {
                    debug!(
                        count = entry.count,
                        limit = limit,
                        reset_at = entry.window_reset_at,
                        "Rate limit exceeded"
                    );
                }
                return Decision {
                    allowed,
                    limit,
                    remaining: entry.remaining(limit),
                    reset_at: entry.window_reset_at,
                };
            }
        }

        let entry = RateLimitEntry::start(now, self.config.window_duration_ms);
        entries.insert(identifier.to_owned(), entry);
        debug!(
            limit = limit,
            window_ms = self.config.window_duration_ms,
            tracked = entries.len(),
            "Opened rate limit window"
        );

        if entries.len() > self.config.max_tracked_identifiers {
            self.evict(&mut entries, identifier);
        }

        Decision {
            allowed: true,
            limit,
            remaining: entry.remaining(limit),
            reset_at: entry.window_reset_at,
        }
    }

    /// Quota left for `identifier` in its current window.
    pub fn get_remaining(&self, identifier: &str) -> u32 {
        let now = self.clock.now();
        let entries = self.entries.read();
        match entries.get(identifier) {
            Some(entry) if !entry.is_expired(now) => entry.remaining(self.config.max_requests),
            _ => self.config.max_requests,
        }
    }

    /// When the window for `identifier` resets.
    ///
    /// For an unknown or expired identifier this is a full window from now.
    pub fn get_reset_time(&self, identifier: &str) -> Timestamp {
        let now = self.clock.now();
        let entries = self.entries.read();
        match entries.get(identifier) {
            Some(entry) if !entry.is_expired(now) => entry.window_reset_at,
            _ => now.saturating_add(self.config.window_duration_ms),
        }
    }

    /// Number of identifiers currently tracked.
    pub fn get_tracked_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove every entry whose window has expired.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!(
                removed = removed,
                tracked = entries.len(),
                "Swept expired rate limit entries"
            );
        }
        removed
    }

    /// Drop all tracked state.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop the least recently seen entries, sparing `keep`.
    fn evict(&self, entries: &mut HashMap<String, RateLimitEntry>, keep: &str) {
        let batch = self.config.eviction_batch();

        let mut candidates: Vec<(Timestamp, String)> = entries
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .map(|(key, entry)| (entry.last_seen_at, key.clone()))
            .collect();
        candidates.sort_unstable();

        for (_, key) in candidates.into_iter().take(batch) {
            entries.remove(&key);
        }

        debug!(
            batch = batch,
            tracked = entries.len(),
            max_tracked = self.config.max_tracked_identifiers,
            "Evicted least recently seen identifiers"
        );
    }
}
