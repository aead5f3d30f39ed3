//! Centralized error types for Axon.
//!
//! Uses `thiserror` for ergonomic error definitions. Only local
//! infrastructure problems surface here; transport failures toward remote
//! servers are absorbed into per-destination backoff state and never appear
//! as an `AxonError`.

/// Core error type used across the Axon delivery crates.
#[derive(Debug, thiserror::Error)]
pub enum AxonError {
    // === Storage errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // === Encoding errors ===
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Configuration errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Everything else ===
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience type alias for Results using AxonError.
pub type AxonResult<T> = Result<T, AxonError>;
