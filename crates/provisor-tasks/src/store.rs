//! The persistence collaborator: service records and their status.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Provisioning status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Ordered, not yet provisioned.
    Pending,
    /// Provisioned and running.
    Active,
    /// Suspended by billing or an operator.
    Suspended,
    /// Resources released.
    Terminated,
    /// Cancelled before provisioning.
    Cancelled,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
        })
    }
}

/// The product a service was ordered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Provisioner module. `None` or blank for products with no provider.
    pub module_name: Option<String>,
}

/// An IP address assigned to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssignment {
    /// The address.
    pub address: String,
    /// Default gateway.
    pub gateway: String,
    /// Netmask.
    pub netmask: String,
}

/// Provider-specific placement and overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Provider region.
    pub region: Option<String>,
    /// Provider node.
    pub node_id: Option<String>,
    /// Free-form options passed to the plugin verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// A service with its product and IP attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service identifier.
    pub id: u64,
    /// Owning customer.
    pub customer_id: u64,
    /// Ordered package.
    pub package_id: u64,
    /// Current status.
    pub status: ServiceStatus,
    /// Product, carrying the module name.
    pub product: Product,
    /// Configuration options chosen at order time.
    #[serde(default)]
    pub config_selection: BTreeMap<String, Value>,
    /// Assigned IP, if any.
    pub ip: Option<IpAssignment>,
    /// Plugin-specific settings, if any.
    pub plugin_settings: Option<PluginSettings>,
}

/// Access to persisted services.
///
/// The worker only reads services and writes their status field.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Load a service with its product and IP attached.
    ///
    /// Returns `Ok(None)` if no such service exists.
    async fn load_service(&self, service_id: u64) -> Result<Option<ServiceRecord>, StoreError>;

    /// Set the status field of a service.
    async fn update_status(&self, service_id: u64, status: ServiceStatus)
    -> Result<(), StoreError>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryServiceStore {
    services: RwLock<HashMap<u64, ServiceRecord>>,
    status_writes: RwLock<Vec<(u64, ServiceStatus)>>,
    fail_updates: std::sync::atomic::AtomicBool,
}

impl MemoryServiceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service.
    pub async fn insert(&self, service: ServiceRecord) {
        self.services.write().await.insert(service.id, service);
    }

    /// Current status of a service.
    pub async fn status(&self, service_id: u64) -> Option<ServiceStatus> {
        self.services
            .read()
            .await
            .get(&service_id)
            .map(|s| s.status)
    }

    /// Every status write, in order.
    pub async fn status_writes(&self) -> Vec<(u64, ServiceStatus)> {
        self.status_writes.read().await.clone()
    }

    /// Make subsequent status updates fail.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceStore for MemoryServiceStore {
    async fn load_service(&self, service_id: u64) -> Result<Option<ServiceRecord>, StoreError> {
        Ok(self.services.read().await.get(&service_id).cloned())
    }

    async fn update_status(
        &self,
        service_id: u64,
        status: ServiceStatus,
    ) -> Result<(), StoreError> {
        if self.fail_updates.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Unavailable("updates disabled".into()));
        }
        let mut services = self.services.write().await;
        let service = services
            .get_mut(&service_id)
            .ok_or_else(|| StoreError::Query(format!("no service {service_id}")))?;
        service.status = status;
        self.status_writes.write().await.push((service_id, status));
        Ok(())
    }
}
