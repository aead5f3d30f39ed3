//! # axon-db
//!
//! Storage layer for the Axon outbound delivery subsystem. One `sqlx`
//! [`AnyPool`] talks to either backend, selected at runtime from the URL:
//! - **PostgreSQL**: native concurrent write transactions, writer is a
//!   pass-through
//! - **SQLite**: a single physical writer, so every write transaction goes
//!   through the exclusive [`writer::Writer`]
//!
//! The store is authoritative for all delivery state. Dispatcher memory is
//! rebuilt from these tables on restart, never the other way around.

pub mod any_compat;
pub mod repository;
pub mod sequence;
pub mod writer;

use anyhow::{bail, Result};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use axon_common::config::DatabaseConfig;
use writer::Writer;

/// Which relational backend the pool speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Detect the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else {
            bail!("unsupported database URL scheme: {url}")
        }
    }
}

/// Shared database state handed to every delivery component.
#[derive(Clone)]
pub struct Database {
    pub pool: AnyPool,
    pub writer: Writer,
    backend: Backend,
}

impl Database {
    /// Connect to the configured backend and pick the writer strategy.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let backend = Backend::from_url(&config.url)?;
        tracing::info!("Connecting to {:?} at {}...", backend, config.url);

        // SQLite gets a pool of one: extra connections to a `:memory:`
        // database would each see their own empty database, and a file
        // database only ever has one writer anyway.
        let (max_conns, min_conns) = match backend {
            Backend::Sqlite => (1, 1),
            Backend::Postgres => (config.max_connections, config.min_connections),
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_conns)
            .min_connections(min_conns)
            .connect(&config.url)
            .await?;

        let writer = match backend {
            Backend::Sqlite => Writer::exclusive(),
            Backend::Postgres => Writer::passthrough(),
        };

        tracing::info!("Connected to {:?}", backend);
        Ok(Self { pool, writer, backend })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Create the delivery tables and seed the stream counters.
    ///
    /// Every schema is `CREATE TABLE IF NOT EXISTS`, so this is safe to run
    /// on every startup.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");
        for schema in [
            sequence::SCHEMA,
            repository::blobs::SCHEMA,
            repository::queue::SCHEMA,
            repository::ledger::SCHEMA,
        ] {
            sqlx::raw_sql(schema).execute(&self.pool).await?;
        }
        sequence::ensure(&self.pool, sequence::PAYLOADS).await?;
        sequence::ensure(&self.pool, sequence::DELIVERIES).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}
