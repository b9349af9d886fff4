//! The task worker: turns a dequeued task into a provider call and a status
//! update.

use std::sync::Arc;
use std::time::Duration;

use provisor_config::PluginsSection;
use provisor_plugins::{CallContext, ClientProvider, CreateServiceRequest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{TaskError, TaskResult};
use crate::options::flatten_options;
use crate::store::{ServiceStatus, ServiceStore};
use crate::task::{ProvisioningTask, TaskKind};

/// Default deadline for a single provider call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Idempotency key sent with every create for `service_id`.
///
/// Stable across retries so a plugin can recognise a repeated create.
#[must_use]
pub fn idempotency_key(service_id: u64) -> String {
    format!("service-{service_id}-provision")
}

/// Processes provisioning tasks.
pub struct TaskWorker {
    store: Arc<dyn ServiceStore>,
    provider: Arc<dyn ClientProvider>,
    rpc_timeout: Duration,
}

impl TaskWorker {
    /// Create a worker reading services from `store` and reaching plugins
    /// through `provider`.
    #[must_use]
    pub fn new(store: Arc<dyn ServiceStore>, provider: Arc<dyn ClientProvider>) -> Self {
        Self {
            store,
            provider,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Create a worker whose provider calls use `rpc_timeout_ms` from the
    /// `[plugins]` section.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn ServiceStore>,
        provider: Arc<dyn ClientProvider>,
        plugins: &PluginsSection,
    ) -> Self {
        Self::new(store, provider).with_rpc_timeout(plugins.rpc_timeout())
    }

    /// Set the deadline applied to each provider call.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// The deadline applied to each provider call.
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Process one task.
    ///
    /// `cancel` aborts an in-flight provider call. It does not stop the
    /// plugin process.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskError`] describing the failure. Use
    /// [`TaskError::is_retryable`] to decide whether to re-enqueue. Suspend,
    /// terminate and unknown tasks fail with [`TaskError::Skipped`].
    pub async fn process_task(
        &self,
        task: &ProvisioningTask,
        cancel: &CancellationToken,
    ) -> TaskResult<()> {
        let result = match task.kind {
            TaskKind::Provision => self.provision(task.service_id, cancel).await,
            TaskKind::Suspend | TaskKind::Terminate | TaskKind::Unknown => {
                Err(TaskError::Skipped {
                    kind: task.kind.to_string(),
                })
            },
        };

        if let Err(e) = &result {
            warn!(
                service_id = task.service_id,
                task_type = %task.kind,
                retryable = e.is_retryable(),
                error = %e,
                "Task failed"
            );
        }
        result
    }

    async fn provision(&self, service_id: u64, cancel: &CancellationToken) -> TaskResult<()> {
        let service = self
            .store
            .load_service(service_id)
            .await
            .map_err(|source| TaskError::Persistence { service_id, source })?
            .ok_or(TaskError::ServiceNotFound { service_id })?;

        let module = service
            .product
            .module_name
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(TaskError::MissingModule {
                service_id,
                product_id: service.product.id,
            })?;

        let client = self.provider.get_client(module).await?;

        let request = CreateServiceRequest {
            service_id: service.id.to_string(),
            customer_id: service.customer_id.to_string(),
            package_id: service.package_id.to_string(),
            options: flatten_options(&service),
            idempotency_key: idempotency_key(service.id),
        };
        let ctx = CallContext::with_timeout(self.rpc_timeout).with_cancel(cancel.child_token());
        let response = client.create_service(&ctx, request).await?;

        info!(
            service_id,
            module = %module,
            external_id = %response.external_id,
            message = %response.message,
            "Service provisioned"
        );

        // The provider side has already succeeded at this point.
        self.store
            .update_status(service_id, ServiceStatus::Active)
            .await
            .map_err(|source| TaskError::Persistence { service_id, source })
    }
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("rpc_timeout", &self.rpc_timeout)
            .finish_non_exhaustive()
    }
}
