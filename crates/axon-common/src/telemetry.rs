//! Tracing bootstrap for processes embedding Axon.
//!
//! Call [`init`] once at startup. Honors `RUST_LOG`; defaults to debug-level
//! output for the axon crates when unset.

/// Install the global tracing subscriber (structured logging).
///
/// # Panics
/// Panics if a global subscriber has already been set.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axon=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}
