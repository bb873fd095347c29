//! # Database Module
//!
//! This module handles persistence for the scheduling and escrow core.
//! PostgreSQL stores every entity; the services reach it through the
//! [`Store`] seam so the same code runs against the in-memory tables in
//! tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DATABASE LAYER                              │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │            Store / StoreTx (unit of work seam)            │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                 │                              │                 │
//! │                 ▼                              ▼                 │
//! │  ┌──────────────────────────┐    ┌──────────────────────────┐   │
//! │  │ PgStore                  │    │ MemoryStore              │   │
//! │  │ deadpool-postgres pool   │    │ mutex-guarded tables     │   │
//! │  │ advisory xact locks      │    │ staged copy per unit     │   │
//! │  └──────────────────────────┘    └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod models;
pub mod pg;
pub mod queries;
pub mod store;

use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio_postgres::{Config as TokioConfig, NoTls};
use tracing::{error, info};

/// Schema applied at startup. Every statement is idempotent.
const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to connect to the database
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Migration failed
    #[error("Migration failed: {0}")]
    MigrationError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A unique constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A stored value could not be decoded into its model type
    #[error("Invalid stored value: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<UnknownVariant> for DatabaseError {
    fn from(e: UnknownVariant) -> Self {
        DatabaseError::Decode(e.to_string())
    }
}

/// Map a driver error to `UniqueViolation` when PostgreSQL reports 23505.
pub(crate) fn classify(e: tokio_postgres::Error) -> DatabaseError {
    let unique = e
        .as_db_error()
        .filter(|db| db.code().code() == "23505")
        .map(|db| db.constraint().unwrap_or("unknown").to_string());
    match unique {
        Some(constraint) => DatabaseError::UniqueViolation(constraint),
        None => DatabaseError::QueryError(e),
    }
}

/// Database connection wrapper.
///
/// Wraps the deadpool connection pool used by [`PgStore`].
///
/// ## Usage
///
/// ```rust,ignore
/// let db = Database::connect("postgres://...").await?;
/// db.run_migrations().await?;
/// let store = PgStore::new(db.clone());
/// ```
#[derive(Clone)]
pub struct Database {
    /// The connection pool
    pool: Pool,
}

impl Database {
    /// Connect to the PostgreSQL database.
    ///
    /// Creates a pool of at most 10 connections and verifies that one of
    /// them answers a trivial query.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        info!("Connecting to database...");

        let tokio_config = database_url
            .parse::<TokioConfig>()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid database URL: {}", e)))?;

        let mut config = Config::new();

        if let Some(dbname) = tokio_config.get_dbname() {
            config.dbname = Some(dbname.to_string());
        }
        if let Some(user) = tokio_config.get_user() {
            config.user = Some(user.to_string());
        }
        if let Some(password) = tokio_config.get_password() {
            config.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(tokio_postgres::config::Host::Tcp(host)) = tokio_config.get_hosts().first() {
            config.host = Some(host.clone());
        }
        if let Some(port) = tokio_config.get_ports().first() {
            config.port = Some(*port);
        }

        config.pool = Some(deadpool_postgres::PoolConfig {
            max_size: 10,
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        let client = pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Apply the schema. Safe to run on every start.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        info!("Running database migrations...");

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        match client.batch_execute(INITIAL_SCHEMA).await {
            Ok(_) => {
                info!("Migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                let detail = e
                    .as_db_error()
                    .and_then(|db| db.detail())
                    .unwrap_or("No detail available")
                    .to_string();
                error!("Migration execution error: {} ({})", e, detail);
                Err(DatabaseError::MigrationError(format!("{} ({})", e, detail)))
            }
        }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

pub use memory::MemoryStore;
pub use models::*;
pub use pg::PgStore;
pub use store::{LockKey, Store, StoreTx};
