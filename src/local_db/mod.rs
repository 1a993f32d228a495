//! # Local Database Module
//!
//! Embedded SQLite storage backing the offline layer. Everything the layer
//! must keep across a restart lives here:
//!
//! - **Pending writes**: buffered mutations awaiting reconciliation
//! - **Dead letters**: writes that will never be retried automatically
//! - **Sync cursors**: last successful reconciliation per collection
//! - **Cached records**: last known remote state, served while offline
//!
//! The schema is applied idempotently on open and versioned through
//! `schema_migrations`. Row access lives in `offline::buffer`.

pub mod schema;

use crate::shared::BufferError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Result type for local database operations
pub type Result<T> = std::result::Result<T, BufferError>;

/// Local database connection manager
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl LocalDatabase {
    /// Open or create the database file at `path`.
    ///
    /// Creates parent directories as needed and runs in WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        db.init_schema().await?;
        tracing::info!("[LocalDb] Opened {}", path.display());
        Ok(db)
    }

    /// Open a private in-memory database (lost when dropped)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every pooled connection would get its own empty database, so keep
        // exactly one and never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool, path: None };
        db.init_schema().await?;
        Ok(db)
    }

    /// Database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(schema::SCHEMA_SQL).execute(&self.pool).await?;
        self.run_migrations().await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let (current,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        for version in schema::pending_migrations(current) {
            // Version 1 is the base schema applied above.
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(schema::encode_time(&chrono::Utc::now()))
                .execute(&self.pool)
                .await?;
            tracing::debug!("[LocalDb] Applied migration {}", version);
        }
        Ok(())
    }

    /// Get database statistics
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let (pending, in_flight): (i64, i64) = sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'in_flight' THEN 1 ELSE 0 END), 0)
             FROM pending_writes",
        )
        .fetch_one(&self.pool)
        .await?;

        let (dead_letters,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        let (cached_records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cached_records")
            .fetch_one(&self.pool)
            .await?;

        let (cursors,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_cursors")
            .fetch_one(&self.pool)
            .await?;

        Ok(DatabaseStats {
            pending_writes: pending as u64,
            in_flight_writes: in_flight as u64,
            dead_letters: dead_letters as u64,
            cached_records: cached_records as u64,
            sync_cursors: cursors as u64,
        })
    }

    /// Remove dead letters older than `days_old` days
    pub async fn cleanup(&self, days_old: i64) -> Result<CleanupStats> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days_old);
        let removed = sqlx::query("DELETE FROM dead_letters WHERE failed_at < ?")
            .bind(schema::encode_time(&cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!("[LocalDb] Purged {} dead letters older than {} days", removed, days_old);
        Ok(CleanupStats {
            dead_letters_removed: removed,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Writes waiting for reconciliation
    pub pending_writes: u64,
    /// Writes claimed by a reconciliation pass
    pub in_flight_writes: u64,
    pub dead_letters: u64,
    pub cached_records: u64,
    pub sync_cursors: u64,
}

/// Cleanup operation statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub dead_letters_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_empty() {
        let db = LocalDatabase::in_memory().await.unwrap();
        assert_eq!(db.stats().await.unwrap(), DatabaseStats::default());
        assert!(db.path().is_none());
    }

    #[tokio::test]
    async fn test_open_creates_file_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("local.db");

        let db = LocalDatabase::open(&path).await.unwrap();
        db.close().await;
        assert!(path.exists());

        // Reopening re-applies the schema without error.
        let db = LocalDatabase::open(&path).await.unwrap();
        let (versions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_dead_letters() {
        let db = LocalDatabase::in_memory().await.unwrap();
        let old = schema::encode_time(&(chrono::Utc::now() - chrono::Duration::days(40)));
        let recent = schema::encode_time(&chrono::Utc::now());
        for (id, failed_at) in [("a", &old), ("b", &recent)] {
            sqlx::query(
                "INSERT INTO dead_letters (local_id, seq, tenant_id, collection, record_id, operation,
                    created_at, attempts, reason, failure_class, failed_at)
                 VALUES (?, 1, 't', 'orders', 'o1', 'update', ?, 1, 'x', 'permanent', ?)",
            )
            .bind(id)
            .bind(failed_at)
            .bind(failed_at)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let stats = db.cleanup(30).await.unwrap();
        assert_eq!(stats.dead_letters_removed, 1);
        assert_eq!(db.stats().await.unwrap().dead_letters, 1);
    }
}
