use crate::config::DatabaseConfig;
use duckdb::{AccessMode, Config, Connection};
use r2d2::{ManageConnection, Pool};
use std::sync::Mutex;
use std::time::Duration;

pub type DbPool = Pool<DuckDBConnectionManager>;

/// Hands out connections to one DuckDB database instance.
///
/// Every pooled connection is cloned from a single root connection, so an
/// in-memory database is shared by the whole pool and a file database is
/// opened (and locked) only once.
pub struct DuckDBConnectionManager {
    root: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    pub fn open(config: &DatabaseConfig) -> Result<Self, duckdb::Error> {
        let target = config.connection_string.trim();
        let conn = if target.is_empty() || target == ":memory:" {
            Connection::open_in_memory()?
        } else if config.read_only {
            Connection::open_with_flags(target, Config::default().access_mode(AccessMode::ReadOnly)?)?
        } else {
            Connection::open(target)?
        };
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            root: Mutex::new(conn),
        }
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Bounded, recycled, health-checked pool.
pub fn build_pool(
    config: &DatabaseConfig,
    manager: DuckDBConnectionManager,
) -> Result<DbPool, r2d2::Error> {
    Pool::builder()
        .max_size(config.pool_size)
        .min_idle(config.min_idle)
        .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
        .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
        .test_on_check_out(true)
        .build(manager)
}
