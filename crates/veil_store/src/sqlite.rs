//! SQLite storage backend.
//!
//! A single `kv` table holds every record of the versioned key layout.
//! WAL journal mode and foreign-key enforcement are configured at
//! connection time, not inside the schema setup, because SQLite forbids
//! changing `journal_mode` inside a transaction.
//!
//! Values are stored as the core hands them over; callers that need
//! at-rest encryption wrap this backend with their own vault layer.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{Storage, StoreError};

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database at `db_path` and set up the schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::setup(pool).await
    }

    /// In-memory database, handy for tests. Pinned to one connection:
    /// every pooled connection would otherwise get its own empty
    /// database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::setup(pool).await
    }

    async fn setup(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

/// Escape LIKE wildcards so a key prefix matches literally.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM kv WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;

    #[tokio::test]
    async fn put_get_del_roundtrip() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        storage.put("v1/user/aa", "record".into()).await.unwrap();
        assert_eq!(
            storage.get("v1/user/aa").await.unwrap().as_deref(),
            Some("record")
        );

        storage.put("v1/user/aa", "updated".into()).await.unwrap();
        assert_eq!(
            storage.get("v1/user/aa").await.unwrap().as_deref(),
            Some("updated")
        );

        storage.del("v1/user/aa").await.unwrap();
        assert_eq!(storage.get("v1/user/aa").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_matches_prefix_literally() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        storage.put("v1/session/aa/1", "".into()).await.unwrap();
        storage.put("v1/session/aa/2", "".into()).await.unwrap();
        storage.put("v1/session/ab/1", "".into()).await.unwrap();
        // Underscore is a LIKE wildcard; it must not match here.
        storage.put("v1/sessionX/zz", "".into()).await.unwrap();

        assert_eq!(
            storage.list("v1/session/aa/").await.unwrap(),
            vec!["v1/session/aa/1", "v1/session/aa/2"]
        );
        assert_eq!(
            storage.list("v1/session_").await.unwrap(),
            Vec::<String>::new()
        );
    }

    #[tokio::test]
    async fn migrations_run_against_sqlite() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        storage.put("invite/legacy", "x".into()).await.unwrap();
        migrations::run_migrations(&storage).await.unwrap();
        assert_eq!(storage.get("invite/legacy").await.unwrap(), None);
        assert_eq!(
            storage
                .get(crate::keys::STORAGE_VERSION_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some(crate::keys::CURRENT_VERSION)
        );
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_reopen() {
        let path = std::env::temp_dir().join(format!("veil-store-test-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let storage = SqliteStorage::open(&path).await.unwrap();
            storage.put("v1/user/aa", "kept".into()).await.unwrap();
        }

        let reopened = SqliteStorage::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("v1/user/aa").await.unwrap().as_deref(),
            Some("kept")
        );

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }
}
