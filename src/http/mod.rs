//! HTTP surface: admission middleware and the admission service.

mod admission;
mod middleware;
mod server;

pub use admission::{router, ApiError, CheckRequest, QuotaQuery, QuotaResponse};
pub use middleware::{
    enforce, KeySource, RateLimitGuard, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use server::HttpServer;
