//! Shared test harness for integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use provisor_plugins::{HandshakeConfig, PluginLoader, PluginManager, PluginScanner, write_sidecar};
use provisor_tasks::{
    IpAssignment, MemoryServiceStore, Product, ServiceRecord, ServiceStatus, ServiceStore,
    TaskWorker,
};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Path to the compiled stub provisioner.
pub fn stub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stub-provisioner"))
}

/// A plugin directory with a manager and an in-memory service store.
///
/// The tempdir is cleaned up when the harness is dropped.
#[allow(dead_code)]
pub struct PluginHarness {
    /// Manager over the plugin directory.
    pub manager: Arc<PluginManager>,
    /// In-memory services.
    pub store: Arc<MemoryServiceStore>,
    dir: TempDir,
}

#[allow(dead_code)]
impl PluginHarness {
    /// A harness with the default handshake and a short handshake timeout.
    pub fn new() -> Self {
        Self::with_handshake(HandshakeConfig::default().with_timeout(Duration::from_secs(2)))
    }

    /// A harness using `handshake` for every load.
    pub fn with_handshake(handshake: HandshakeConfig) -> Self {
        let dir = TempDir::new().expect("failed to create plugin dir");
        let manager = PluginManager::new(
            PluginScanner::new(dir.path()),
            PluginLoader::new(handshake),
        )
        .with_shutdown_timeout(Duration::from_secs(1));
        Self {
            manager: Arc::new(manager),
            store: Arc::new(MemoryServiceStore::new()),
            dir,
        }
    }

    /// The plugin directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Copy the stub in as `name` and write its checksum sidecar.
    pub fn install(&self, name: &str) -> PathBuf {
        let path = self.install_unsigned(name);
        write_sidecar(&path).expect("failed to write sidecar");
        path
    }

    /// Copy the stub in as `name` without a sidecar.
    pub fn install_unsigned(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::copy(stub_binary(), &path).expect("failed to copy stub");
        path
    }

    /// Requests the stub installed as `binary` has received, oldest first.
    pub fn requests(&self, binary: &Path) -> Vec<Value> {
        let log = PathBuf::from(format!("{}.requests.jsonl", binary.display()));
        match std::fs::read_to_string(log) {
            Ok(text) => text
                .lines()
                .map(|l| serde_json::from_str(l).expect("bad request log line"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// A worker over this harness's store and manager.
    pub fn worker(&self) -> TaskWorker {
        TaskWorker::new(
            Arc::clone(&self.store) as Arc<dyn ServiceStore>,
            Arc::clone(&self.manager) as Arc<dyn provisor_plugins::ClientProvider>,
        )
        .with_rpc_timeout(Duration::from_secs(5))
    }

    /// Insert a pending service ordered from a product using `module`.
    pub async fn add_service(&self, id: u64, module: Option<&str>) -> ServiceRecord {
        let service = ServiceRecord {
            id,
            customer_id: 1001,
            package_id: 17,
            status: ServiceStatus::Pending,
            product: Product {
                id: 5,
                name: "Cloud VPS".into(),
                module_name: module.map(str::to_owned),
            },
            config_selection: BTreeMap::from([
                ("os".to_owned(), json!("debian-12")),
                ("cpu_cores".to_owned(), json!(2)),
                ("backups".to_owned(), json!(true)),
            ]),
            ip: Some(IpAssignment {
                address: "198.51.100.42".into(),
                gateway: "198.51.100.1".into(),
                netmask: "255.255.255.0".into(),
            }),
            plugin_settings: None,
        };
        self.store.insert(service.clone()).await;
        service
    }
}
