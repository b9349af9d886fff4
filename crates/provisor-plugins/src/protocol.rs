//! Provisioner protocol: the operations every plugin exposes.
//!
//! All identifiers cross the wire as strings and field names are camelCase.
//! Every operation takes a [`CallContext`] carrying the deadline and
//! cancellation token for that call.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PluginResult;

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

/// Deadline and cancellation for a single call.
///
/// Expiry or cancellation abandons the call. It never terminates the plugin
/// process.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline and a fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now().checked_add(timeout))
    }

    /// Replace the deadline.
    #[must_use]
    pub fn deadline_at(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Tie this call to an external cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The absolute deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `Some(ZERO)` once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the call has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// RPC method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Create and provision a new service.
    CreateService,
    /// Suspend a service.
    Suspend,
    /// Terminate a service.
    Terminate,
    /// Move a service to another package.
    ChangePackage,
    /// Start, stop or reboot a service.
    PowerControl,
    /// Read usage metrics.
    GetUsage,
    /// Liveness probe.
    Ping,
}

impl Method {
    /// All methods, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::CreateService,
        Self::Suspend,
        Self::Terminate,
        Self::ChangePackage,
        Self::PowerControl,
        Self::GetUsage,
        Self::Ping,
    ];

    /// The wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateService => "provisioner.create_service",
            Self::Suspend => "provisioner.suspend",
            Self::Terminate => "provisioner.terminate",
            Self::ChangePackage => "provisioner.change_package",
            Self::PowerControl => "provisioner.power_control",
            Self::GetUsage => "provisioner.get_usage",
            Self::Ping => "provisioner.ping",
        }
    }

    /// Look a method up by its wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope wrapping every request's params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParams<T> {
    /// Milliseconds left before the host abandons the call.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// The operation's request.
    pub request: T,
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Create a new service on the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    /// Service identifier, decimal.
    pub service_id: String,
    /// Owning customer, decimal.
    pub customer_id: String,
    /// Package to provision, decimal.
    pub package_id: String,
    /// Flattened configuration. Keys are unique.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Stable per service, so a plugin can recognise a retried create.
    #[serde(default)]
    pub idempotency_key: String,
}

/// Result of [`Provisioner::create_service`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceResponse {
    /// The provider's identifier for the new resource.
    pub external_id: String,
    /// Human-readable status.
    #[serde(default)]
    pub message: String,
}

/// Suspend a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendRequest {
    /// Service identifier, decimal.
    pub service_id: String,
    /// Free-form reason recorded by the provider.
    #[serde(default)]
    pub reason: String,
}

/// Terminate a service and release its resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    /// Service identifier, decimal.
    pub service_id: String,
    /// Free-form reason recorded by the provider.
    #[serde(default)]
    pub reason: String,
}

/// Move a service between packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePackageRequest {
    /// Service identifier, decimal.
    pub service_id: String,
    /// Package the service is on now.
    pub current_package_id: String,
    /// Package to move to.
    pub target_package_id: String,
    /// Free-form reason recorded by the provider.
    #[serde(default)]
    pub reason: String,
}

/// Power actions accepted by [`Provisioner::power_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    /// Power on.
    Start,
    /// Power off.
    Stop,
    /// Power cycle.
    Reboot,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::Reboot => f.write_str("reboot"),
        }
    }
}

/// Change the power state of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerControlRequest {
    /// Service identifier, decimal.
    pub service_id: String,
    /// Requested power action.
    pub action: PowerAction,
}

/// Read the usage of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUsageRequest {
    /// Service identifier, decimal.
    pub service_id: String,
}

/// One usage sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetric {
    /// Metric name.
    pub name: String,
    /// Unit of `value`.
    pub unit: String,
    /// Sampled value.
    pub value: f64,
}

/// Result of [`Provisioner::get_usage`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetUsageResponse {
    /// Samples, in provider order.
    #[serde(default)]
    pub metrics: Vec<UsageMetric>,
    /// Human-readable status.
    #[serde(default)]
    pub message: String,
}

/// Response carrying only a status message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Human-readable status.
    #[serde(default)]
    pub message: String,
}

impl MessageResponse {
    /// Wrap a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Operations every provisioner implements.
///
/// The host talks to plugins through [`ProvisionerClient`](crate::ProvisionerClient);
/// plugin binaries implement this trait and hand it to [`serve`](crate::serve).
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a new service.
    async fn create_service(
        &self,
        ctx: &CallContext,
        request: CreateServiceRequest,
    ) -> PluginResult<CreateServiceResponse>;

    /// Suspend a service.
    async fn suspend(&self, ctx: &CallContext, request: SuspendRequest)
    -> PluginResult<MessageResponse>;

    /// Terminate a service.
    async fn terminate(
        &self,
        ctx: &CallContext,
        request: TerminateRequest,
    ) -> PluginResult<MessageResponse>;

    /// Change the package of a service.
    async fn change_package(
        &self,
        ctx: &CallContext,
        request: ChangePackageRequest,
    ) -> PluginResult<MessageResponse>;

    /// Start, stop or reboot a service.
    async fn power_control(
        &self,
        ctx: &CallContext,
        request: PowerControlRequest,
    ) -> PluginResult<MessageResponse>;

    /// Read usage metrics.
    async fn get_usage(
        &self,
        ctx: &CallContext,
        request: GetUsageRequest,
    ) -> PluginResult<GetUsageResponse>;

    /// Liveness probe. Answers immediately unless overridden.
    async fn ping(&self, _ctx: &CallContext) -> PluginResult<MessageResponse> {
        Ok(MessageResponse::new("pong"))
    }
}
