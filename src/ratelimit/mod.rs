//! Rate limiting logic and state management.

mod clock;
mod entry;
mod limiter;
mod policy;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use entry::RateLimitEntry;
pub use limiter::{Decision, RateLimiter, RateLimiterConfig};
pub use policy::{PolicyRegistry, PolicySet, PolicyStats, API_POLICY, AUTH_POLICY};
pub use sweeper::Sweeper;
