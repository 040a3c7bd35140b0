use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::config::DatabaseConfig;

/// Bounded pool of tuned SQLite connections.
///
/// Every connection is configured once at creation: WAL journal, relaxed
/// durability, a 64 MB page cache, memory-resident temp storage and
/// enforced foreign keys. Acquire blocks up to the configured timeout and
/// surfaces `sqlx::Error::PoolTimedOut` beyond it; a transaction dropped
/// without commit is rolled back before its connection is reused.
#[derive(Clone)]
pub struct DbPool {
    pool: SqlitePool,
}

impl DbPool {
    pub async fn new(cfg: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", cfg.sqlite_path))
            .with_context(|| format!("Invalid sqlite path: {}", cfg.sqlite_path))?
            .create_if_missing(true);

        Self::build(options, cfg.pool_size + cfg.max_overflow, cfg).await
    }

    /// Private in-memory database, used by tests and the per-test stores.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let cfg = DatabaseConfig {
            database_type: "sqlite".into(),
            url: None,
            sqlite_path: ":memory:".into(),
            pool_size: 1,
            max_overflow: 0,
            pool_timeout_seconds: 5,
            pool_recycle_seconds: 1800,
            echo: false,
        };
        // A single connection: every handle sees the same memory database.
        Self::build(options, 1, &cfg).await
    }

    async fn build(
        options: SqliteConnectOptions,
        max_connections: u32,
        cfg: &DatabaseConfig,
    ) -> Result<Self> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Negative cache_size is KiB: 64 MB page cache.
            .pragma("cache_size", "-65536")
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(cfg.pool_timeout_seconds.max(1)))
            .max_lifetime(Duration::from_secs(cfg.pool_recycle_seconds.max(1)))
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        Self::bootstrap_schema(&pool).await?;

        info!(
            max_connections,
            timeout_s = cfg.pool_timeout_seconds,
            "Database pool ready"
        );
        Ok(Self { pool })
    }

    async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                hashed_password TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL
                    REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS user_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                conversation_id INTEGER NOT NULL
                    REFERENCES conversations(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                file_path TEXT NOT NULL,
                uploaded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"#,
        )
        .execute(pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
             ON messages(conversation_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_user_documents_user_conv \
             ON user_documents(user_id, conversation_id)",
        ] {
            sqlx::query(stmt).execute(pool).await?;
        }

        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close_all(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pool_has_schema() {
        let db = DbPool::in_memory().await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.get_pool())
                .await
                .unwrap();
        assert!(count >= 4);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = DbPool::in_memory().await.unwrap();
        let result = sqlx::query("INSERT INTO conversations (user_id, title) VALUES (999, 't')")
            .execute(db.get_pool())
            .await;
        assert!(result.is_err());
    }
}
