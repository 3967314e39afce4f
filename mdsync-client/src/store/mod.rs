//! Persistent stores: replay-protection nonces and pending tasks.
//!
//! Nonces are never stored in plain form. Each is hashed together with the
//! identity it belongs to, so a database dump reveals neither the nonces nor
//! which identity used them.

mod memory;
mod sqlite;

pub use memory::{MemoryNonceStore, MemoryTaskStore};
pub use sqlite::SqliteStore;

use crate::task::{TaskData, TaskId};
use async_trait::async_trait;
use mdsync_types::{IdentityId, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separation prefix for nonce hashes.
const NONCE_HASH_CONTEXT: &[u8] = b"mdsync-nonce-v1";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted record could not be read back.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Hash of a nonce scoped to an identity.
pub type NonceHash = [u8; 32];

/// Compute the stored form of a nonce.
pub fn hash_nonce(scope: &IdentityId, nonce: &Nonce) -> NonceHash {
    let mut hasher = Sha256::new();
    hasher.update(NONCE_HASH_CONTEXT);
    hasher.update(scope.as_str().as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.finalize().into()
}

/// Hash a batch of nonces, dropping duplicates within the batch.
pub(crate) fn hash_batch(scope: &IdentityId, nonces: &[Nonce]) -> Vec<NonceHash> {
    let mut hashes: Vec<NonceHash> = nonces.iter().map(|n| hash_nonce(scope, n)).collect();
    hashes.sort_unstable();
    hashes.dedup();
    hashes
}

/// Durable set of nonces already used or observed.
///
/// Shared across all tasks; implementations serialize their own access.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Insert all nonces of one message atomically.
    ///
    /// Returns `false` and inserts nothing if any nonce was already present.
    async fn insert_all(&self, scope: &IdentityId, nonces: &[Nonce]) -> Result<bool, StoreError>;

    /// Remove nonces, e.g. to compensate for an effect that did not apply.
    async fn remove_all(&self, scope: &IdentityId, nonces: &[Nonce]) -> Result<(), StoreError>;

    /// Check whether a nonce is present.
    async fn contains(&self, scope: &IdentityId, nonce: &Nonce) -> Result<bool, StoreError>;

    /// Number of stored nonces across all scopes.
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Durable queue of serializable tasks that have not completed yet.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a task. Saving an existing id replaces its data.
    async fn save(&self, id: TaskId, data: &TaskData) -> Result<(), StoreError>;

    /// Forget a completed task.
    async fn remove(&self, id: TaskId) -> Result<(), StoreError>;

    /// All pending tasks in the order they were first saved.
    async fn load_all(&self) -> Result<Vec<(TaskId, TaskData)>, StoreError>;
}
