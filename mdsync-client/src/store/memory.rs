//! In-memory stores for tests and ephemeral sessions.

use super::{hash_batch, hash_nonce, NonceHash, NonceStore, StoreError, TaskStore};
use crate::task::{TaskData, TaskId};
use async_trait::async_trait;
use mdsync_types::{IdentityId, Nonce};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Nonce store backed by a hash set.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    hashes: Mutex<HashSet<NonceHash>>,
}

impl MemoryNonceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn insert_all(&self, scope: &IdentityId, nonces: &[Nonce]) -> Result<bool, StoreError> {
        let batch = hash_batch(scope, nonces);
        let mut hashes = lock(&self.hashes);

        if batch.iter().any(|h| hashes.contains(h)) {
            return Ok(false);
        }
        hashes.extend(batch);
        Ok(true)
    }

    async fn remove_all(&self, scope: &IdentityId, nonces: &[Nonce]) -> Result<(), StoreError> {
        let mut hashes = lock(&self.hashes);
        for hash in hash_batch(scope, nonces) {
            hashes.remove(&hash);
        }
        Ok(())
    }

    async fn contains(&self, scope: &IdentityId, nonce: &Nonce) -> Result<bool, StoreError> {
        Ok(lock(&self.hashes).contains(&hash_nonce(scope, nonce)))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(lock(&self.hashes).len() as u64)
    }
}

/// Task store backed by a vector in save order.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<(TaskId, TaskData)>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, id: TaskId, data: &TaskData) -> Result<(), StoreError> {
        let mut tasks = lock(&self.tasks);
        match tasks.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = data.clone(),
            None => tasks.push((id, data.clone())),
        }
        Ok(())
    }

    async fn remove(&self, id: TaskId) -> Result<(), StoreError> {
        lock(&self.tasks).retain(|(existing, _)| *existing != id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(TaskId, TaskData)>, StoreError> {
        Ok(lock(&self.tasks).clone())
    }
}
