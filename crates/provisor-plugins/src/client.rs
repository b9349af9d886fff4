//! Host-side [`Provisioner`] backed by a plugin's RPC channel.

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::RpcChannel;
use crate::error::PluginResult;
use crate::protocol::{
    CallContext, ChangePackageRequest, CreateServiceRequest, CreateServiceResponse,
    GetUsageRequest, GetUsageResponse, MessageResponse, Method, PowerControlRequest, Provisioner,
    SuspendRequest, TerminateRequest,
};

/// Cheap, cloneable handle for calling a loaded plugin.
///
/// Clones share the same channel. Once the plugin is unloaded every call
/// fails with [`PluginError::ChannelClosed`](crate::PluginError::ChannelClosed).
#[derive(Debug, Clone)]
pub struct ProvisionerClient {
    channel: Arc<RpcChannel>,
}

impl ProvisionerClient {
    pub(crate) fn new(channel: Arc<RpcChannel>) -> Self {
        Self { channel }
    }

    /// Module name of the plugin behind this client.
    #[must_use]
    pub fn module(&self) -> &str {
        self.channel.module()
    }

    /// Whether both clients talk over the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel)
    }

    /// Whether the underlying channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

#[async_trait]
impl Provisioner for ProvisionerClient {
    async fn create_service(
        &self,
        ctx: &CallContext,
        request: CreateServiceRequest,
    ) -> PluginResult<CreateServiceResponse> {
        self.channel.call(Method::CreateService, &request, ctx).await
    }

    async fn suspend(
        &self,
        ctx: &CallContext,
        request: SuspendRequest,
    ) -> PluginResult<MessageResponse> {
        self.channel.call(Method::Suspend, &request, ctx).await
    }

    async fn terminate(
        &self,
        ctx: &CallContext,
        request: TerminateRequest,
    ) -> PluginResult<MessageResponse> {
        self.channel.call(Method::Terminate, &request, ctx).await
    }

    async fn change_package(
        &self,
        ctx: &CallContext,
        request: ChangePackageRequest,
    ) -> PluginResult<MessageResponse> {
        self.channel.call(Method::ChangePackage, &request, ctx).await
    }

    async fn power_control(
        &self,
        ctx: &CallContext,
        request: PowerControlRequest,
    ) -> PluginResult<MessageResponse> {
        self.channel.call(Method::PowerControl, &request, ctx).await
    }

    async fn get_usage(
        &self,
        ctx: &CallContext,
        request: GetUsageRequest,
    ) -> PluginResult<GetUsageResponse> {
        self.channel.call(Method::GetUsage, &request, ctx).await
    }

    async fn ping(&self, ctx: &CallContext) -> PluginResult<MessageResponse> {
        self.channel
            .call(Method::Ping, &serde_json::json!({}), ctx)
            .await
    }
}
