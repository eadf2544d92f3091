//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Request-time limiter calls never return this; it covers configuration,
/// policy lookup and server plumbing.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy definition failed validation
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// A policy name with no configured limiter
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
