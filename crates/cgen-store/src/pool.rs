//! Connection pool and schema bootstrap.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreResult;

const SCHEMA: &str = include_str!("schema.sql");

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database URL
    pub database_url: String,
    /// Maximum pool connections
    pub max_connections: u32,
    /// Busy timeout for locked writes
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:cgen.db?mode=rwc".to_string(),
            max_connections: 10,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connections),
            busy_timeout: std::env::var("DATABASE_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_timeout),
        }
    }
}

/// Job record store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Connect with WAL mode and apply the schema.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        info!(
            max_connections = config.max_connections,
            "Job store initialized"
        );
        Ok(store)
    }

    /// Private in-memory database on a single connection (tests and dev).
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Round-trip check used by readiness probes.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
