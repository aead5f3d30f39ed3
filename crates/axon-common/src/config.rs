//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call axon_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at process startup by whatever embeds the delivery
/// subsystem. Library consumers that manage their own config can call
/// [`load`] instead and never touch the global.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build an [`AppConfig`] from defaults, an optional `config.toml`, and
/// `AXON_*` environment variables, without installing it globally.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.name", "localhost")?
        .set_default("database.url", "sqlite://axon.db")?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("delivery.batch_size", 50)?
        .set_default("delivery.worker_limit", 64)?
        .set_default("delivery.sweep_interval_secs", 60)?
        .set_default("delivery.idle_timeout_secs", 30)?
        .set_default("delivery.edu_ttl_secs", 86_400)?
        .set_default("delivery.backoff_base_secs", 2)?
        .set_default("delivery.backoff_max_secs", 3_600)?
        .set_default("delivery.blacklist_threshold", 16)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (AXON_SERVER__NAME, AXON_DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("AXON")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name used for federation (e.g. "axon.example.com").
    /// Events are never queued for delivery back to this name.
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Connection URL. `postgres://...` selects PostgreSQL,
    /// `sqlite://...` selects SQLite with single-writer discipline.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Knobs for the outbound delivery pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Maximum queue entries handed to the transport per attempt.
    pub batch_size: u32,
    /// Global cap on concurrently draining destinations.
    pub worker_limit: u32,
    /// How often the sweep re-scans for destinations with pending work.
    pub sweep_interval_secs: u64,
    /// How long a fully drained worker lingers before exiting.
    pub idle_timeout_secs: u64,
    /// Queued EDUs older than this are dropped instead of delivered.
    pub edu_ttl_secs: u64,
    /// First retry delay after a failed attempt; doubles per failure.
    pub backoff_base_secs: u64,
    /// Ceiling for the retry delay.
    pub backoff_max_secs: u64,
    /// Consecutive failures before a destination is blacklisted.
    pub blacklist_threshold: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            worker_limit: 64,
            sweep_interval_secs: 60,
            idle_timeout_secs: 30,
            edu_ttl_secs: 86_400,
            backoff_base_secs: 2,
            backoff_max_secs: 3_600,
            blacklist_threshold: 16,
        }
    }
}
