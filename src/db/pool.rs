/// Shared SQLite connection pool for bar storage
use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{BackfillError, Result};
use crate::types::DatabaseConfig;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Borrowed connection; returned to the pool on drop
pub type ConnectionLease = PooledConnection<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS market_data (
    ticker      TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    date        TEXT NOT NULL,
    exchange    TEXT NOT NULL,
    open_price  REAL NOT NULL,
    high_price  REAL NOT NULL,
    low_price   REAL NOT NULL,
    close_price REAL NOT NULL,
    volume      INTEGER NOT NULL,
    PRIMARY KEY (ticker, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_market_data_date ON market_data (date);
";

pub struct BarDatabase {
    pool: DbPool,
    max_connections: u32,
}

impl BarDatabase {
    /// Open (or create) the store and make sure the schema exists
    pub fn open(path: &Path, max_connections: u32, connection_timeout: Duration) -> Result<Self> {
        if max_connections == 0 {
            return Err(BackfillError::InvalidParameter(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.busy_timeout(BUSY_TIMEOUT)
        });

        let pool = Pool::builder()
            .max_size(max_connections)
            .connection_timeout(connection_timeout)
            .build(manager)?;

        pool.get()?.execute_batch(SCHEMA)?;

        info!(
            "🗄️  Opened bar store {} (pool size {})",
            path.display(),
            max_connections
        );

        Ok(BarDatabase {
            pool,
            max_connections,
        })
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(
            &config.path,
            config.max_connections,
            Duration::from_secs(config.connection_timeout_secs),
        )
    }

    /// Block until a connection is free or the pool timeout passes
    pub fn lease(&self) -> Result<ConnectionLease> {
        Ok(self.pool.get()?)
    }

    /// Cheap handle for moving into blocking tasks
    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Connections currently checked out
    pub fn leased(&self) -> u32 {
        let state = self.pool.state();
        state.connections - state.idle_connections
    }

    /// Consumes the handle so the pool can only be closed once
    pub fn close(self) {
        let state = self.pool.state();
        info!(
            "🔒 Closing connection pool ({} open, {} idle)",
            state.connections, state.idle_connections
        );
        drop(self.pool);
    }
}
