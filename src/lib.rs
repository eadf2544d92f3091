//! Turnstile - in-memory request throttling
//!
//! This crate implements a process-local, fixed-window rate limiter keyed by
//! caller identifier, with bounded memory through least-recently-seen
//! eviction and a periodic sweep of expired windows. Limiters are grouped
//! into named policies and exposed to request-handling code through axum
//! middleware or a small HTTP admission service.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
