//! SQLite backend for nonces and pending tasks.

use super::{hash_batch, hash_nonce, NonceStore, StoreError, TaskStore};
use crate::task::{TaskData, TaskId};
use async_trait::async_trait;
use mdsync_types::{IdentityId, Nonce};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// SQLite-based nonce and task storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path.to_str().unwrap_or("mdsync.db"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nonces (
                nonce_hash BLOB PRIMARY KEY,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                data BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl NonceStore for SqliteStore {
    async fn insert_all(&self, scope: &IdentityId, nonces: &[Nonce]) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        for hash in hash_batch(scope, nonces) {
            let result =
                sqlx::query("INSERT INTO nonces (nonce_hash) VALUES (?1) ON CONFLICT(nonce_hash) DO NOTHING")
                    .bind(hash.to_vec())
                    .execute(&mut *tx)
                    .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                debug!("Nonce batch rejected: at least one nonce already used");
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn remove_all(&self, scope: &IdentityId, nonces: &[Nonce]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for hash in hash_batch(scope, nonces) {
            sqlx::query("DELETE FROM nonces WHERE nonce_hash = ?1")
                .bind(hash.to_vec())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn contains(&self, scope: &IdentityId, nonce: &Nonce) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM nonces WHERE nonce_hash = ?1")
            .bind(hash_nonce(scope, nonce).to_vec())
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nonces")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save(&self, id: TaskId, data: &TaskData) -> Result<(), StoreError> {
        let bytes = data
            .to_bytes()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pending_tasks (task_id, data) VALUES (?1, ?2)
            ON CONFLICT(task_id) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(id.to_string())
        .bind(bytes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, id: TaskId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_tasks WHERE task_id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(TaskId, TaskData)>, StoreError> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT task_id, data FROM pending_tasks ORDER BY seq")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(id, data)| {
                let id = TaskId::parse(&id)
                    .ok_or_else(|| StoreError::Corrupt(format!("invalid task id: {}", id)))?;
                let data =
                    TaskData::from_bytes(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok((id, data))
            })
            .collect()
    }
}
