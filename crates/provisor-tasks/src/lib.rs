#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Provisioning task pipeline for provisor.
//!
//! The order and billing side enqueues `{type, serviceID}` payloads through a
//! [`TaskEnqueuer`]. A [`WorkerPool`] pulls them off a [`MemoryQueue`] and
//! hands each one to the [`TaskWorker`], which loads the service from a
//! [`ServiceStore`], obtains a provisioner client for the product's module
//! and calls `CreateService`. Retryable failures go back on the queue after
//! the [`RetryPolicy`] delay. Tasks that run out of retries are marked dead.
//!
//! The worker only changes a service's status, and only after the provider
//! reports success.

/// Task error types.
pub mod error;
/// Service option flattening.
pub mod options;
/// Worker pool.
pub mod pool;
/// Task queue.
pub mod queue;
/// Backoff policy.
pub mod retry;
/// Service persistence.
pub mod store;
/// Task payloads and states.
pub mod task;
/// The task worker.
pub mod worker;

pub use error::{StoreError, TaskError, TaskResult};
pub use options::{flatten_options, stringify_value};
pub use pool::WorkerPool;
pub use queue::{MemoryQueue, TaskEnqueuer};
pub use retry::RetryPolicy;
pub use store::{
    IpAssignment, MemoryServiceStore, PluginSettings, Product, ServiceRecord, ServiceStatus,
    ServiceStore,
};
pub use task::{ProvisioningTask, TaskKind, TaskRecord, TaskState};
pub use worker::{TaskWorker, idempotency_key};
