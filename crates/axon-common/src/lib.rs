//! # axon-common
//!
//! Shared configuration, error handling, and telemetry used across all Axon
//! crates. This is the foundation layer: no delivery logic, just primitives
//! and contracts.

pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{AxonError, AxonResult};
