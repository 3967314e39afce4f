//! Show device and replay-protection status.

use anyhow::{Context, Result};
use mdsync_client::{NonceStore, SqliteStore, Task, TaskStore};
use std::path::Path;

use crate::config;

/// Counts read from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    /// Nonces recorded for replay protection
    pub nonces: u64,
    /// Tasks persisted but not yet completed
    pub pending: Vec<String>,
}

/// Read the store summary from a database.
pub async fn summarize(database: &Path) -> Result<StoreSummary> {
    let store = SqliteStore::open(database)
        .await
        .with_context(|| format!("Failed to open database {}", database.display()))?;

    let nonces = store.count().await?;
    let pending = store
        .load_all()
        .await?
        .into_iter()
        .map(|(id, data)| format!("{} {}", id, Task::from_data(data).describe()))
        .collect();
    Ok(StoreSummary { nonces, pending })
}

/// Run the status command.
pub async fn run(data_dir: &Path) -> Result<()> {
    println!("=== mdsync status ===");
    println!();

    let client_config = match config::load(data_dir) {
        Ok(client_config) => client_config,
        Err(_) => {
            println!("Device: NOT INITIALIZED");
            println!();
            println!("Run 'mdsync init --label <label>' to initialize.");
            return Ok(());
        }
    };

    println!("Device:");
    println!("  Label:    {}", client_config.device.label);
    if let Some(platform) = &client_config.device.platform {
        println!("  Platform: {}", platform);
    }
    println!();

    let summary = summarize(&client_config.storage.database).await?;
    println!("Storage:");
    println!("  Database: {}", client_config.storage.database.display());
    println!("  Nonces:   {}", summary.nonces);
    println!("  Pending:  {} tasks", summary.pending.len());
    for task in &summary.pending {
        println!("    {}", task);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use mdsync_client::{TaskData, TaskId};
    use mdsync_types::{IdentityId, MessageId, MessageType, Nonce, ReflectedEnvelope};
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_without_init() {
        let dir = tempdir().unwrap();

        // Should succeed but show "not initialized"
        let result = run(dir.path()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn status_with_device() {
        let dir = tempdir().unwrap();
        init::run(dir.path(), "Test Device", None).await.unwrap();

        let result = run(dir.path()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn summarize_counts_nonces_and_pending_tasks() {
        let dir = tempdir().unwrap();
        let database = dir.path().join("status.db");
        let scope = IdentityId::new("MEMEMEME").unwrap();

        {
            let store = SqliteStore::open(&database).await.unwrap();
            store
                .insert_all(&scope, &[Nonce::from_bytes([1; 24]), Nonce::from_bytes([2; 24])])
                .await
                .unwrap();
            let envelope = ReflectedEnvelope {
                message_id: MessageId::from_u64(1),
                sender_identity: scope.clone(),
                created_at: 1_000,
                msg_type: MessageType::DeleteMessage as u8,
                nonces: vec![],
                payload: vec![],
            };
            store
                .save(TaskId::new(), &TaskData::Reflected { envelope })
                .await
                .unwrap();
        }

        let summary = summarize(&database).await.unwrap();
        assert_eq!(summary.nonces, 2);
        assert_eq!(summary.pending.len(), 1);
    }
}
