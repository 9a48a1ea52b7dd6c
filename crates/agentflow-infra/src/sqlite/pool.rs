//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows one writer at a time. `DatabasePool` pairs a multi-connection
//! read-only pool for listings and lookups with a single-connection writer
//! pool. Both use WAL journal mode and enforce foreign keys, which the
//! checkpoint table relies on for cascading deletes.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: up to 8 read-only connections.
/// - `writer`: one connection for every INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and run migrations on the writer before the reader
    /// pool connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, "database pool ready");
        Ok(Self { reader, writer })
    }
}

/// Database URL under `AGENTFLOW_DATA_DIR`, falling back to
/// `~/.agentflow/agentflow.db`.
pub fn default_database_url() -> String {
    let data_dir = crate::config::default_data_dir();
    format!("sqlite://{}/agentflow.db", data_dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool(name: &str) -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join(name).display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let (_dir, pool) = pool("tables.db").await;

        let tables: Vec<(String,)> = sqlx::query_as(
            r#"SELECT name FROM sqlite_master
               WHERE type = 'table'
                 AND name NOT LIKE 'sqlite_%'
                 AND name != '_sqlx_migrations'
               ORDER BY name"#,
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            table_names,
            vec!["workflow_checkpoints", "workflow_definitions", "workflow_executions"]
        );
    }

    #[tokio::test]
    async fn test_pool_wal_mode_and_foreign_keys() {
        let (_dir, pool) = pool("pragmas.db").await;

        let journal: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(journal.0.to_lowercase(), "wal");

        let fk: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk.0, 1, "foreign keys should be enabled");
    }

    #[tokio::test]
    async fn test_reader_is_read_only() {
        let (_dir, pool) = pool("readonly.db").await;
        let result = sqlx::query("DELETE FROM workflow_definitions")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_default_database_url() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("agentflow.db"));
    }
}
