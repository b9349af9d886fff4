//! Task payloads and the per-task state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

/// What a task asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Create the service on its provider.
    Provision,
    /// Suspend the service.
    Suspend,
    /// Terminate the service.
    Terminate,
    /// Any type this build does not know.
    #[serde(other)]
    Unknown,
}

impl TaskKind {
    /// The payload name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Suspend => "suspend",
            Self::Terminate => "terminate",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task payload as enqueued by the order and billing side.
///
/// Serialized as `{"type": "provision", "serviceID": 42}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningTask {
    /// Task type.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Target service.
    #[serde(rename = "serviceID")]
    pub service_id: u64,
}

impl ProvisioningTask {
    /// A provision task for `service_id`.
    #[must_use]
    pub fn provision(service_id: u64) -> Self {
        Self {
            kind: TaskKind::Provision,
            service_id,
        }
    }

    /// A suspend task for `service_id`.
    #[must_use]
    pub fn suspend(service_id: u64) -> Self {
        Self {
            kind: TaskKind::Suspend,
            service_id,
        }
    }

    /// A terminate task for `service_id`.
    #[must_use]
    pub fn terminate(service_id: u64) -> Self {
        Self {
            kind: TaskKind::Terminate,
            service_id,
        }
    }

    /// Decode a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidPayload`] if the payload is not a task.
    pub fn from_json(payload: &[u8]) -> TaskResult<Self> {
        serde_json::from_slice(payload).map_err(|e| TaskError::InvalidPayload(e.to_string()))
    }
}

/// Lifecycle of a task.
///
/// ```text
/// Pending -> Running -> Succeeded
///                    -> FailedTerminal
///                    -> FailedRetryable -> Pending (after backoff)
///                                       -> Dead    (retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be picked up.
    Pending,
    /// Being processed by a worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed, eligible for retry.
    FailedRetryable,
    /// Failed, never retried.
    FailedTerminal,
    /// Retry budget exhausted. Needs an operator.
    Dead,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal | Self::Dead)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (
                    Self::Running,
                    Self::Succeeded | Self::FailedRetryable | Self::FailedTerminal
                )
                | (Self::FailedRetryable, Self::Pending | Self::Dead)
        )
    }

    /// Snake-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task together with its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Queue-assigned identifier.
    pub id: Uuid,
    /// The payload.
    pub task: ProvisioningTask,
    /// Current state.
    pub state: TaskState,
    /// Retries performed so far. Zero on the first attempt.
    pub retry_count: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh pending record.
    #[must_use]
    pub fn new(task: ProvisioningTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] if the state machine forbids
    /// the move. The record is left unchanged.
    pub fn transition(&mut self, next: TaskState) -> TaskResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
