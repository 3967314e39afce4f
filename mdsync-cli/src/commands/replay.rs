//! Replay reflected envelopes through the task manager.
//!
//! The replay file is a JSON array of reflected envelopes. Domain effects
//! go to in-memory services, but replay protection and pending tasks use
//! the configured database, so replaying the same file twice reports
//! duplicates.

use anyhow::{Context, Result};
use mdsync_client::{
    ClientConfig, Collaborators, MemoryMultiDeviceBackend, MemoryServices, MockTransport,
    QueueStatus, Services, SqliteStore, SyncCore, TaskCompletion, TaskOutcome, TaskResult,
    TaskStore,
};
use mdsync_types::{IdentityId, ReflectedEnvelope};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config;

/// Read envelopes from a JSON replay file.
pub async fn read_envelopes(path: &Path) -> Result<Vec<ReflectedEnvelope>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).context("Invalid replay file")
}

/// Run the envelopes through a fresh session and collect their completions.
pub async fn replay(
    client_config: ClientConfig,
    identity: IdentityId,
    envelopes: &[ReflectedEnvelope],
) -> Result<Vec<TaskCompletion>> {
    replay_into(client_config, identity, MemoryServices::new(), envelopes).await
}

/// Replay against the given in-memory services.
async fn replay_into(
    client_config: ClientConfig,
    identity: IdentityId,
    services: MemoryServices,
    envelopes: &[ReflectedEnvelope],
) -> Result<Vec<TaskCompletion>> {
    if envelopes.is_empty() {
        anyhow::bail!("Replay file contains no envelopes");
    }

    let store = Arc::new(
        SqliteStore::open(&client_config.storage.database)
            .await
            .context("Failed to open database")?,
    );
    let pending = store.load_all().await?.len() as u64;

    let transport = MockTransport::new();
    for envelope in envelopes {
        transport.queue_frame(envelope.to_bytes()?);
    }

    let backend = MemoryMultiDeviceBackend::new();
    let collaborators = Collaborators {
        services: Services::in_memory(identity, services),
        transport: Arc::new(transport),
        backend: Arc::new(backend.clone()),
        forward_security: Arc::new(backend),
    };
    let core = SyncCore::login_with_stores(client_config, collaborators, store.clone(), store)
        .await?;

    let mut completions = core.task_manager().completions();
    let pump = core.start_reflection_pump();

    let last_sequence = pending + envelopes.len() as u64 - 1;
    let mut collected = Vec::new();
    if let QueueStatus::Halted { reason } = core.task_manager().status() {
        debug!("Queue halted before replay started: {}", reason);
    } else {
        while let Ok(completion) = completions.recv().await {
            let done = completion.sequence >= last_sequence || !completion.result.is_success();
            collected.push(completion);
            if done {
                break;
            }
        }
    }

    // The pump may be blocked submitting into a full, halted queue.
    core.task_manager().shutdown().await;
    let close_reason = pump.await.context("Reflection pump panicked")?;
    debug!("Replay connection closed: {}", close_reason);
    core.logout().await?;
    Ok(collected)
}

/// Human readable form of a task result.
pub fn describe_result(result: &TaskResult) -> String {
    match result {
        TaskResult::Succeeded(TaskOutcome::Completed) => "completed".to_string(),
        TaskResult::Succeeded(TaskOutcome::Duplicate) => "duplicate".to_string(),
        TaskResult::Succeeded(TaskOutcome::Skipped(cause)) => format!("skipped: {}", cause),
        TaskResult::Failed(err) => format!("FAILED: {}", err),
    }
}

/// Run the replay command.
pub async fn run(data_dir: &Path, identity: &str, file: &Path) -> Result<()> {
    let client_config = config::load(data_dir)?;
    let identity = IdentityId::new(identity).context("Invalid identity")?;
    let envelopes = read_envelopes(file).await?;

    println!("Replaying {} envelopes as {}...", envelopes.len(), identity);
    let completions = replay(client_config, identity, &envelopes).await?;

    for completion in &completions {
        println!(
            "  #{} {}: {}",
            completion.sequence,
            completion.description,
            describe_result(&completion.result)
        );
    }

    if completions.iter().any(|c| !c.result.is_success()) {
        println!();
        println!("Queue halted. Remaining envelopes were not applied.");
    }

    Ok(())
}
