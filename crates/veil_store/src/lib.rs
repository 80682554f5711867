//! veil_store — the storage contract for Veil Secure Messaging.
//!
//! Storage is an async key-value map with prefix listing. Backends are
//! injected; the core never opens files or databases itself. All
//! operations surface failure as a `Result` — I/O errors are never
//! panics and never silently swallowed here.
//!
//! # Modules
//! - `keys`       — the versioned key layout (`v1/...`)
//! - `memory`     — in-memory backend for tests and ephemeral use
//! - `sqlite`     — SQLite-backed key-value store
//! - `migrations` — storage-version upgrades

pub mod keys;
pub mod memory;
pub mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Abstract async key-value storage.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// All keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
