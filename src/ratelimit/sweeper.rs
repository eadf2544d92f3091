//! Background sweep of expired rate limit entries.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;

/// Handle to a running sweep task.
///
/// The task ticks once per window of its limiter and removes expired
/// entries. Dropping the handle also stops the task, but without waiting
/// for it.
#[derive(Debug)]
pub struct Sweeper {
    policy: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Start sweeping `limiter` on the current tokio runtime.
    pub fn spawn(policy: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        let policy = policy.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = limiter.config().window();

        info!(policy = %policy, period_ms = limiter.config().window_duration_ms, "Starting sweeper");

        let task_policy = policy.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        debug!(
                            policy = %task_policy,
                            removed = removed,
                            tracked = limiter.get_tracked_count(),
                            "Sweep complete"
                        );
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            policy,
            stop_tx,
            task,
        }
    }

    /// Policy this sweeper serves.
    pub fn policy(&self) -> &str {
        &self.policy
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(policy = %self.policy, error = %e, "Sweeper task ended abnormally");
            return;
        }
        info!(policy = %self.policy, "Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, RateLimiterConfig};
    use std::time::Duration;

    fn limiter(window: Duration) -> (Arc<RateLimiter>, ManualClock) {
        let clock = ManualClock::new(0);
        let limiter =
            RateLimiter::with_clock(RateLimiterConfig::new(5, window), Arc::new(clock.clone())).unwrap();
        (Arc::new(limiter), clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let (limiter, clock) = limiter(Duration::from_secs(1));
        limiter.is_allowed("gone");

        let sweeper = Sweeper::spawn("test", limiter.clone());
        clock.advance(Duration::from_secs(2));

        time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.get_tracked_count(), 0);
        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_skips_first_immediate_tick() {
        let (limiter, clock) = limiter(Duration::from_secs(10));
        limiter.is_allowed("kept");
        clock.advance(Duration::from_secs(20));

        let sweeper = Sweeper::spawn("test", limiter.clone());
        time::sleep(Duration::from_millis(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.get_tracked_count(), 1);
        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_keeps_active_entries() {
        let (limiter, clock) = limiter(Duration::from_secs(1));
        let sweeper = Sweeper::spawn("test", limiter.clone());

        clock.advance(Duration::from_millis(500));
        limiter.is_allowed("active");

        time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.get_tracked_count(), 1);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let (limiter, _) = limiter(Duration::from_secs(3600));
        let sweeper = Sweeper::spawn("auth", limiter);

        assert_eq!(sweeper.policy(), "auth");
        tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
            .await
            .expect("sweeper should stop promptly");
    }
}
