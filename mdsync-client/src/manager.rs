//! Sequential task execution.
//!
//! A single worker drains a bounded queue. Tasks start in submission order
//! and complete in submission order; no two tasks ever overlap.
//!
//! # Failure handling
//!
//! - `NotFound`: the task is skipped and the queue advances
//! - transient I/O: idempotent tasks are retried with backoff
//! - everything else, or an exhausted retry: the queue halts until
//!   [`TaskManager::resume`] is called by the reconnection logic

use crate::store::{StoreError, TaskStore};
use crate::task::{SkipCause, Task, TaskContext, TaskError, TaskId, TaskOutcome};
use mdsync_core::RetryPolicy;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Completion events buffered for slow subscribers.
const COMPLETION_BUFFER: usize = 256;

/// Task manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager was shut down.
    #[error("task manager stopped")]
    Stopped,

    /// A serializable task could not be persisted.
    #[error("failed to persist task: {0}")]
    Store(#[from] StoreError),
}

/// Queue state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    /// Tasks are being executed.
    Running,
    /// A task failed fatally; nothing runs until resumed.
    Halted {
        /// Error that halted the queue
        reason: String,
    },
    /// The manager was shut down.
    Stopped,
}

/// Final result of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// The task finished.
    Succeeded(TaskOutcome),
    /// The task failed and halted the queue.
    Failed(TaskError),
}

impl TaskResult {
    /// Whether the task finished without error.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Succeeded(_))
    }
}

/// Completion event, published in submission order.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    /// Task id
    pub task_id: TaskId,
    /// Position in submission order
    pub sequence: u64,
    /// Task description
    pub description: String,
    /// Result
    pub result: TaskResult,
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    sequence: u64,
    result: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Position in submission order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for the task to finish.
    ///
    /// Returns `Stopped` if the manager shut down before the task ran.
    pub async fn wait(self) -> Result<TaskResult, ManagerError> {
        self.result.await.map_err(|_| ManagerError::Stopped)
    }
}

struct Submission {
    id: TaskId,
    sequence: u64,
    task: Task,
    persisted: bool,
    reply: oneshot::Sender<TaskResult>,
}

/// Sequential task executor.
pub struct TaskManager {
    queue: mpsc::Sender<Submission>,
    next_sequence: Mutex<u64>,
    store: Arc<dyn TaskStore>,
    status: Arc<watch::Sender<QueueStatus>>,
    completions: broadcast::Sender<TaskCompletion>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(
        ctx: TaskContext,
        store: Arc<dyn TaskStore>,
        queue_capacity: usize,
        policy: RetryPolicy,
    ) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let status = Arc::new(watch::channel(QueueStatus::Running).0);
        let (completions, _) = broadcast::channel(COMPLETION_BUFFER);

        let worker = Worker {
            rx,
            ctx,
            store: Arc::clone(&store),
            policy,
            status: Arc::clone(&status),
            completions: completions.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            queue,
            next_sequence: Mutex::new(0),
            store,
            status,
            completions,
            worker: StdMutex::new(Some(handle)),
        }
    }

    /// Submit a task.
    ///
    /// Serializable tasks are persisted before they are queued. Waits for
    /// queue capacity when the queue is full.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle, ManagerError> {
        let mut next = self.next_sequence.lock().await;
        self.ensure_running()?;

        let id = TaskId::new();
        let persisted = match task.serialize() {
            Some(data) => {
                self.store.save(id, &data).await?;
                true
            }
            None => false,
        };

        self.enqueue(&mut next, id, task, persisted).await
    }

    /// Queue every task left in the store by a previous session.
    ///
    /// Call once after startup, before new tasks are submitted.
    pub async fn resume_persisted(&self) -> Result<usize, ManagerError> {
        let mut next = self.next_sequence.lock().await;
        self.ensure_running()?;

        let pending = self.store.load_all().await?;
        let count = pending.len();
        for (id, data) in pending {
            // Completion is observed through the broadcast.
            let _handle = self.enqueue(&mut next, id, Task::from_data(data), true).await?;
        }

        if count > 0 {
            info!("Resumed {} persisted tasks", count);
        }
        Ok(count)
    }

    async fn enqueue(
        &self,
        next: &mut u64,
        id: TaskId,
        task: Task,
        persisted: bool,
    ) -> Result<TaskHandle, ManagerError> {
        let sequence = *next;
        let (reply, result) = oneshot::channel();

        debug!("Queueing task {} ({})", sequence, task.describe());
        self.queue
            .send(Submission {
                id,
                sequence,
                task,
                persisted,
                reply,
            })
            .await
            .map_err(|_| ManagerError::Stopped)?;

        *next += 1;
        Ok(TaskHandle {
            id,
            sequence,
            result,
        })
    }

    fn ensure_running(&self) -> Result<(), ManagerError> {
        if *self.status.borrow() == QueueStatus::Stopped {
            return Err(ManagerError::Stopped);
        }
        Ok(())
    }

    /// Subscribe to completion events.
    pub fn completions(&self) -> broadcast::Receiver<TaskCompletion> {
        self.completions.subscribe()
    }

    /// Current queue status.
    pub fn status(&self) -> QueueStatus {
        self.status.borrow().clone()
    }

    /// Observe queue status changes.
    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    /// Continue after a fatal error halted the queue.
    ///
    /// Returns `false` if the queue was not halted.
    pub fn resume(&self) -> bool {
        let resumed = self.status.send_if_modified(|status| {
            if matches!(status, QueueStatus::Halted { .. }) {
                *status = QueueStatus::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("Task queue resumed");
        }
        resumed
    }

    /// Stop the worker after the running task finishes.
    ///
    /// Queued tasks are dropped; serializable ones stay persisted.
    pub async fn shutdown(&self) {
        self.status.send_replace(QueueStatus::Stopped);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Task manager worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.status.send_replace(QueueStatus::Stopped);
    }
}

struct Worker {
    rx: mpsc::Receiver<Submission>,
    ctx: TaskContext,
    store: Arc<dyn TaskStore>,
    policy: RetryPolicy,
    status: Arc<watch::Sender<QueueStatus>>,
    completions: broadcast::Sender<TaskCompletion>,
}

impl Worker {
    async fn run(mut self) {
        let mut stop = self.status.subscribe();
        let mut gate = self.status.subscribe();

        loop {
            let submission = tokio::select! {
                biased;
                _ = stop.wait_for(|s| *s == QueueStatus::Stopped) => break,
                next = self.rx.recv() => match next {
                    Some(submission) => submission,
                    None => break,
                },
            };

            let running = match gate
                .wait_for(|s| !matches!(s, QueueStatus::Halted { .. }))
                .await
            {
                Ok(status) => *status == QueueStatus::Running,
                Err(_) => false,
            };
            if !running {
                break;
            }

            self.execute(submission).await;
        }

        debug!("Task manager worker stopped");
    }

    async fn execute(&self, submission: Submission) {
        let Submission {
            id,
            sequence,
            task,
            persisted,
            reply,
        } = submission;
        let description = task.describe();
        debug!("Running task {} ({})", sequence, description);

        let result = match self.run_with_retry(&task).await {
            Ok(outcome) => TaskResult::Succeeded(outcome),
            Err(err) => {
                error!("Task {} ({}) failed: {}", sequence, description, err);
                self.halt(&err);
                TaskResult::Failed(err)
            }
        };

        if persisted {
            if let Err(e) = self.store.remove(id).await {
                warn!("Failed to remove completed task {}: {}", id, e);
            }
        }

        let _ = self.completions.send(TaskCompletion {
            task_id: id,
            sequence,
            description,
            result: result.clone(),
        });
        let _ = reply.send(result);
    }

    async fn run_with_retry(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        let mut failures = 0u32;

        loop {
            match task.run(&self.ctx).await {
                Ok(outcome) => return Ok(outcome),
                Err(TaskError::NotFound(what)) => {
                    warn!("Skipping task ({}): {} not found", task.describe(), what);
                    return Ok(TaskOutcome::Skipped(SkipCause::NotFound(what)));
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if !self.policy.should_retry(task.is_idempotent(), failures) {
                        return Err(err);
                    }
                    let delay = self.policy.backoff(failures);
                    warn!(
                        "Task ({}) failed: {}, retry {} in {:?}",
                        task.describe(),
                        err,
                        failures,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn halt(&self, err: &TaskError) {
        self.status.send_if_modified(|status| {
            if *status == QueueStatus::Running {
                *status = QueueStatus::Halted {
                    reason: err.to_string(),
                };
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{MemoryServices, ServiceError, Services};
    use crate::store::{MemoryNonceStore, MemoryTaskStore};
    use crate::task::{OutgoingVoipCallAnswerTask, ReflectedTask, TaskData};
    use crate::transport::MockTransport;
    use mdsync_types::{
        CallAnswerAction, ConversationRef, IdentityId, MessageId, MessageType, Nonce, PollVote,
        ReflectedEnvelope, VoipCallAnswer, WirePayload,
    };
    use std::time::Duration;

    struct Harness {
        services: MemoryServices,
        transport: MockTransport,
        store: Arc<MemoryTaskStore>,
        manager: TaskManager,
    }

    fn me() -> IdentityId {
        IdentityId::new("MEMEMEME").unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100))
    }

    fn harness_with(store: Arc<MemoryTaskStore>, policy: RetryPolicy) -> Harness {
        let services = MemoryServices::new();
        let transport = MockTransport::new();
        let ctx = TaskContext {
            services: Services::in_memory(me(), services.clone()),
            nonces: Arc::new(MemoryNonceStore::new()),
            transport: Arc::new(transport.clone()),
        };
        let manager = TaskManager::spawn(ctx, store.clone(), 8, policy);
        Harness {
            services,
            transport,
            store,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryTaskStore::new()), policy())
    }

    fn vote_envelope(poll_id: u64) -> ReflectedEnvelope {
        let vote = PollVote::new(
            ConversationRef::Contact {
                identity: IdentityId::new("ECHOECHO").unwrap(),
            },
            me(),
            poll_id,
            vec![1],
        );
        ReflectedEnvelope {
            message_id: MessageId::from_u64(poll_id),
            sender_identity: me(),
            created_at: 1_000,
            msg_type: MessageType::PollVote as u8,
            nonces: vec![Nonce::from_bytes([poll_id as u8; 24])],
            payload: vote.to_bytes().unwrap(),
        }
    }

    fn vote_task(poll_id: u64) -> Task {
        ReflectedTask::new(vote_envelope(poll_id)).into()
    }

    fn call_answer() -> Task {
        OutgoingVoipCallAnswerTask::new(
            IdentityId::new("CALLER01").unwrap(),
            VoipCallAnswer::new(1, CallAnswerAction::Accept),
        )
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn completions_follow_submission_order() {
        let h = harness();
        h.transport.delay_sends([
            Duration::from_millis(300),
            Duration::ZERO,
            Duration::from_millis(100),
        ]);
        let mut completions = h.manager.completions();

        let mut handles = Vec::new();
        for poll_id in 1..=3 {
            handles.push(h.manager.submit(vote_task(poll_id)).await.unwrap());
        }

        for expected in 0..3 {
            let completion = completions.recv().await.unwrap();
            assert_eq!(completion.sequence, expected);
            assert!(completion.result.is_success());
        }
        for handle in handles {
            assert_eq!(
                handle.wait().await.unwrap(),
                TaskResult::Succeeded(TaskOutcome::Completed)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_task_is_retried() {
        let h = harness();
        h.transport.fail_sends(2);

        let handle = h.manager.submit(vote_task(1)).await.unwrap();
        let result = handle.wait().await.unwrap();

        // The first attempt applied the vote; retries only re-send the ack.
        assert_eq!(result, TaskResult::Succeeded(TaskOutcome::Duplicate));
        assert_eq!(h.services.vote_calls(), 1);
        assert_eq!(h.transport.sent_frames().len(), 1);
        assert_eq!(h.manager.status(), QueueStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_halt_queue() {
        let h = harness_with(
            Arc::new(MemoryTaskStore::new()),
            RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10)),
        );
        h.transport.fail_sends(5);

        let result = h.manager.submit(vote_task(1)).await.unwrap().wait().await.unwrap();

        assert!(matches!(result, TaskResult::Failed(TaskError::TransientIo(_))));
        assert!(matches!(h.manager.status(), QueueStatus::Halted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_failure_halts_until_resumed() {
        let h = harness();
        h.transport.fail_sends(1);
        let mut status = h.manager.watch_status();

        let failed = h.manager.submit(call_answer()).await.unwrap();
        let queued = h.manager.submit(vote_task(2)).await.unwrap();

        assert!(matches!(
            failed.wait().await.unwrap(),
            TaskResult::Failed(TaskError::TransientIo(_))
        ));
        status
            .wait_for(|s| matches!(s, QueueStatus::Halted { .. }))
            .await
            .unwrap();

        // Nothing runs while halted
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.services.vote_calls(), 0);
        assert_eq!(h.store.load_all().await.unwrap().len(), 1);

        assert!(h.manager.resume());
        assert!(!h.manager.resume());
        assert!(queued.wait().await.unwrap().is_success());
        assert_eq!(h.services.vote_calls(), 1);
        assert!(h.store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_skipped() {
        let h = harness();
        h.services
            .fail_next_effect(ServiceError::NotFound("poll 3".into()));

        let result = h.manager.submit(vote_task(3)).await.unwrap().wait().await.unwrap();

        assert_eq!(
            result,
            TaskResult::Succeeded(TaskOutcome::Skipped(SkipCause::NotFound("poll 3".into())))
        );
        assert_eq!(h.manager.status(), QueueStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_tasks_are_resumed_in_order() {
        let store = Arc::new(MemoryTaskStore::new());
        let first = TaskId::new();
        let second = TaskId::new();
        store
            .save(first, &TaskData::Reflected { envelope: vote_envelope(1) })
            .await
            .unwrap();
        store
            .save(second, &TaskData::Reflected { envelope: vote_envelope(2) })
            .await
            .unwrap();

        let h = harness_with(store, policy());
        let mut completions = h.manager.completions();

        assert_eq!(h.manager.resume_persisted().await.unwrap(), 2);
        assert_eq!(completions.recv().await.unwrap().task_id, first);
        assert_eq!(completions.recv().await.unwrap().task_id, second);
        assert!(h.store.load_all().await.unwrap().is_empty());
        assert_eq!(h.services.vote_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ephemeral_tasks_are_not_persisted() {
        let h = harness();
        h.transport.delay_sends([Duration::from_secs(1)]);

        let handle = h.manager.submit(call_answer()).await.unwrap();
        assert!(h.store.load_all().await.unwrap().is_empty());

        assert!(handle.wait().await.unwrap().is_success());
        assert_eq!(h.services.required_message_ids().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_tasks() {
        let h = harness();
        h.manager.submit(vote_task(1)).await.unwrap().wait().await.unwrap();

        h.manager.shutdown().await;

        assert_eq!(h.manager.status(), QueueStatus::Stopped);
        assert!(matches!(
            h.manager.submit(vote_task(2)).await,
            Err(ManagerError::Stopped)
        ));
    }
}
