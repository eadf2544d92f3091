//! Per-identifier fixed-window counter state.

use super::clock::Timestamp;

/// Counter state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests admitted in the current window
    pub count: u32,
    /// When the current window expires and the count resets
    pub window_reset_at: Timestamp,
    /// Most recent request, used for eviction ordering
    pub last_seen_at: Timestamp,
}

impl RateLimitEntry {
    /// Open a fresh window at `now` holding one admitted request.
    pub fn start(now: Timestamp, window_ms: u64) -> Self {
        Self {
            count: 1,
            window_reset_at: now.saturating_add(window_ms),
            last_seen_at: now,
        }
    }

    /// Whether the window has run out at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.window_reset_at
    }

    /// Record a request against an active window.
    ///
    /// Returns `true` if the request is within `limit`. A denied request
    /// refreshes `last_seen_at` but leaves the count alone.
    pub fn record(&mut self, now: Timestamp, limit: u32) -> bool {
        self.last_seen_at = now;
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }

    /// Remaining quota under `limit`.
    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }
}
