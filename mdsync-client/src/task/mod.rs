//! Tasks executed by the [`TaskManager`](crate::TaskManager).
//!
//! A task is a closed sum of the variants this device can execute. Each
//! variant is either serializable (persisted before it runs and resumed
//! after a restart) or ephemeral (lost when the process dies).

mod reflected;
mod voip;

pub use reflected::{ReflectedMessage, ReflectedTask};
pub use voip::OutgoingVoipCallAnswerTask;

use std::fmt;
use std::sync::Arc;

use crate::services::{ServiceError, Services};
use crate::store::{NonceStore, StoreError};
use crate::transport::{Transport, TransportError};
use mdsync_core::{SkipReason, UnsupportedReceipt};
use mdsync_types::{ReflectedEnvelope, WireError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique id of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted form of a serializable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskData {
    /// A reflected message waiting to be processed.
    Reflected {
        /// The reflected envelope as received
        envelope: ReflectedEnvelope,
    },
}

impl TaskData {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

/// Task execution errors.
///
/// Decode failures and unsupported payloads never appear here; tasks
/// handle them locally and complete with [`TaskOutcome::Skipped`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O failed in a way that may succeed on retry.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The connection is in an unrecoverable state.
    #[error("fatal protocol error: {0}")]
    FatalProtocol(String),

    /// Local persistence failed.
    #[error("store error: {0}")]
    Store(String),
}

impl TaskError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::TransientIo(_))
    }
}

impl From<TransportError> for TaskError {
    fn from(err: TransportError) -> Self {
        TaskError::TransientIo(err.to_string())
    }
}

impl From<ServiceError> for TaskError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(what) => TaskError::NotFound(what),
            ServiceError::Unavailable(msg) => TaskError::TransientIo(msg),
            ServiceError::Failed(msg) => TaskError::FatalProtocol(msg),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        TaskError::Store(err.to_string())
    }
}

impl From<WireError> for TaskError {
    fn from(err: WireError) -> Self {
        TaskError::FatalProtocol(err.to_string())
    }
}

/// Why a task completed without applying its effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCause {
    /// The message type is not handled by this device.
    Dispatch(SkipReason),
    /// The payload could not be decoded.
    Decode(String),
    /// A replay-protected message arrived without nonces.
    MissingNonces,
    /// The receipt code has no reaction counterpart.
    UnsupportedReceipt(UnsupportedReceipt),
    /// A referenced entity does not exist.
    NotFound(String),
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipCause::Dispatch(SkipReason::UnknownType(tag)) => {
                write!(f, "unknown message type {:#04x}", tag)
            }
            SkipCause::Dispatch(SkipReason::NotReflected(mt)) => {
                write!(f, "{:?} is never reflected", mt)
            }
            SkipCause::Decode(msg) => write!(f, "decode failed: {}", msg),
            SkipCause::MissingNonces => write!(f, "replay protected message without nonces"),
            SkipCause::UnsupportedReceipt(err) => write!(f, "{}", err),
            SkipCause::NotFound(what) => write!(f, "not found: {}", what),
        }
    }
}

/// Successful task result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The effect was applied.
    Completed,
    /// The message was already processed; nothing was applied.
    Duplicate,
    /// The task advanced without applying an effect.
    Skipped(SkipCause),
}

/// Shared dependencies handed to every task run.
#[derive(Clone)]
pub struct TaskContext {
    /// Domain collaborators
    pub services: Services,
    /// Replay-protection nonce store
    pub nonces: Arc<dyn NonceStore>,
    /// Mediator connection
    pub transport: Arc<dyn Transport>,
}

/// A unit of work executed by the task manager.
#[derive(Debug, Clone)]
pub enum Task {
    /// Process a message reflected by another device.
    Reflected(ReflectedTask),
    /// Send a call answer.
    VoipCallAnswer(OutgoingVoipCallAnswerTask),
}

impl Task {
    /// Rebuild a task from its persisted form.
    pub fn from_data(data: TaskData) -> Self {
        match data {
            TaskData::Reflected { envelope } => Task::Reflected(ReflectedTask::new(envelope)),
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Task::Reflected(task) => task.describe(),
            Task::VoipCallAnswer(task) => task.describe(),
        }
    }

    /// Persisted form, or `None` if the task is ephemeral.
    pub fn serialize(&self) -> Option<TaskData> {
        match self {
            Task::Reflected(task) => Some(task.serialize()),
            Task::VoipCallAnswer(_) => None,
        }
    }

    /// Whether the task may safely run more than once.
    pub fn is_idempotent(&self) -> bool {
        match self {
            Task::Reflected(_) => true,
            Task::VoipCallAnswer(_) => false,
        }
    }

    /// Run the task once.
    pub async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        match self {
            Task::Reflected(task) => task.run(ctx).await,
            Task::VoipCallAnswer(task) => task.run(ctx).await,
        }
    }
}

impl From<ReflectedTask> for Task {
    fn from(task: ReflectedTask) -> Self {
        Task::Reflected(task)
    }
}

impl From<OutgoingVoipCallAnswerTask> for Task {
    fn from(task: OutgoingVoipCallAnswerTask) -> Self {
        Task::VoipCallAnswer(task)
    }
}
