//! Task error types.

use provisor_plugins::PluginError;

use crate::task::TaskState;

/// Errors reported by a [`ServiceStore`](crate::ServiceStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the query or update.
    #[error("store query failed: {0}")]
    Query(String),
}

/// Errors from processing a provisioning task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task references a service that does not exist.
    #[error("service {service_id} not found")]
    ServiceNotFound {
        /// The missing service.
        service_id: u64,
    },

    /// The service's product names no provisioner module.
    #[error("product {product_id} of service {service_id} has no module name")]
    MissingModule {
        /// The service being processed.
        service_id: u64,
        /// The product lacking a module.
        product_id: u64,
    },

    /// Plugin resolution, loading or RPC failed.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Reading or updating the service record failed.
    #[error("persistence error for service {service_id}: {source}")]
    Persistence {
        /// The service being processed.
        service_id: u64,
        /// Underlying store error.
        source: StoreError,
    },

    /// The task type is not handled and will not be retried.
    #[error("skipped {kind} task")]
    Skipped {
        /// The task type, as it appeared in the payload.
        kind: String,
    },

    /// The task payload could not be decoded.
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    /// A task record was moved to a state it cannot reach.
    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },
}

impl TaskError {
    /// Whether the queue may retry the task after a backoff delay.
    ///
    /// RPC, transport and persistence failures are retryable. Integrity,
    /// resolution and handshake failures, missing modules, unknown services
    /// and skipped tasks are terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Plugin(e) => !e.is_fatal(),
            Self::Persistence { .. } => true,
            Self::ServiceNotFound { .. }
            | Self::MissingModule { .. }
            | Self::Skipped { .. }
            | Self::InvalidPayload(_)
            | Self::InvalidTransition { .. } => false,
        }
    }
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;
