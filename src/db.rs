//! SQLite handle for persisted network state.
//!
//! Every pooled connection is opened with WAL journaling and a busy timeout,
//! so the periodic state save and the CLI's inspection commands can share a
//! file. The schema lives in `migrations/` and is applied on open.
//!
//! ```no_run
//! use netjob_core::db::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("netjob.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// State writes are small and infrequent; a few connections are plenty.
const MAX_CONNECTIONS: u32 = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("cannot open state database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("state database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("state database query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Pooled SQLite handle with the schema applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database at `db_path`, creating the file if needed.
    ///
    /// # Errors
    ///
    /// [`DbError::Open`] if the file cannot be opened, [`DbError::Migration`]
    /// if the schema cannot be applied.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: db_path.to_path_buf(),
                source,
            })?;
        Self::migrated(pool).await
    }

    /// A private in-memory database. A single connection keeps every query on
    /// the same memory store.
    ///
    /// # Errors
    ///
    /// As [`Database::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("state schema up to date");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Whether the database journals through a write-ahead log.
    ///
    /// # Errors
    ///
    /// [`DbError::Query`] if the pragma cannot be read.
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Waits for pooled connections to finish and closes them.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_has_state_table() {
        let db = Database::new_in_memory().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM network_state")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_unknown_state_kind_is_rejected() {
        let db = Database::new_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO network_state (kind, context, version, blob) VALUES ('cache', '{}', 1, '{}')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let db = Database::new(&path).await.unwrap();
        assert!(path.exists());
        assert!(db.is_wal_enabled().await.unwrap());
        db.close().await;

        // reopening runs no migration twice
        let db = Database::new(&path).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_open_failure_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("state.db");
        let err = Database::new(&path).await.unwrap_err();
        assert!(matches!(err, DbError::Open { .. }));
        assert!(err.to_string().contains("missing"));
    }
}
