//! Plugin manager: one live plugin per module name.
//!
//! Lookups take the cache's read lock. A miss takes a per-module load lock so
//! that concurrent first callers share a single load, while loads of
//! different modules proceed in parallel. The cache write lock is only held
//! to insert or remove an entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::ProvisionerClient;
use crate::error::{PluginError, PluginResult};
use crate::loader::{LoadedPlugin, PluginLoader};
use crate::protocol::{CallContext, Provisioner};
use crate::scanner::PluginScanner;

/// Default grace period when killing plugin processes.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of provisioner clients keyed by module name.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Return a ready client for `module`, loading it if necessary.
    async fn get_client(&self, module: &str) -> PluginResult<Arc<dyn Provisioner>>;
}

/// Caches one loaded plugin per module name.
pub struct PluginManager {
    scanner: PluginScanner,
    loader: PluginLoader,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    loading: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown_timeout: Duration,
}

impl PluginManager {
    /// Create a manager resolving through `scanner` and loading through `loader`.
    #[must_use]
    pub fn new(scanner: PluginScanner, loader: PluginLoader) -> Self {
        Self {
            scanner,
            loader,
            plugins: RwLock::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the grace period used when killing plugin processes.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The scanner used for module resolution.
    #[must_use]
    pub fn scanner(&self) -> &PluginScanner {
        &self.scanner
    }

    /// The loader used for new plugins.
    #[must_use]
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Number of plugin processes started so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.loader.spawn_count()
    }

    /// Return the client for `module`, loading the plugin on first use.
    ///
    /// A cached plugin whose process has exited is evicted and loaded again.
    ///
    /// # Errors
    ///
    /// Propagates [`PluginError::Resolution`], [`PluginError::Integrity`],
    /// [`PluginError::Spawn`] and [`PluginError::Handshake`] from resolution
    /// and loading.
    pub async fn get_client(&self, module: &str) -> PluginResult<ProvisionerClient> {
        if let Some(client) = self.cached_client(module).await {
            return Ok(client);
        }

        let flight = self.load_lock(module).await;
        let result = {
            let _flight = flight.lock().await;
            self.load_locked(module).await
        };
        self.release_load_lock(module, &flight).await;
        result
    }

    /// Kill the plugin for `module` and drop it from the cache.
    ///
    /// Returns `false` if nothing was loaded.
    pub async fn unload_plugin(&self, module: &str) -> bool {
        let flight = self.load_lock(module).await;
        let removed = {
            let _flight = flight.lock().await;
            self.plugins.write().await.remove(module)
        };
        self.release_load_lock(module, &flight).await;

        match removed {
            Some(plugin) => {
                plugin.shutdown(self.shutdown_timeout).await;
                true
            },
            None => {
                debug!(module = %module, "Unload requested for a module that is not loaded");
                false
            },
        }
    }

    /// Ping the plugin for `module`, loading it if needed.
    ///
    /// A plugin that fails the ping for any reason other than caller
    /// cancellation is unloaded.
    ///
    /// # Errors
    ///
    /// Returns the load error or the ping error.
    pub async fn probe(&self, module: &str, ctx: &CallContext) -> PluginResult<()> {
        let client = self.get_client(module).await?;
        match client.ping(ctx).await {
            Ok(_) => Ok(()),
            Err(e @ PluginError::Cancelled { .. }) => Err(e),
            Err(e) => {
                warn!(module = %module, error = %e, "Liveness probe failed, unloading plugin");
                self.unload_plugin(module).await;
                Err(e)
            },
        }
    }

    /// Remove every cached plugin whose process has exited.
    ///
    /// Returns the evicted module names.
    pub async fn evict_dead(&self) -> Vec<String> {
        let snapshot: Vec<(String, Arc<LoadedPlugin>)> = self
            .plugins
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut evicted = Vec::new();
        for (module, plugin) in snapshot {
            if !plugin.is_alive().await && self.evict(&module, &plugin).await {
                evicted.push(module);
            }
        }
        evicted
    }

    /// Names of the modules currently cached, sorted.
    pub async fn loaded_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        modules.sort();
        modules
    }

    /// Whether `module` is cached.
    pub async fn is_loaded(&self, module: &str) -> bool {
        self.plugins.read().await.contains_key(module)
    }

    /// Kill every plugin and empty the cache.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<LoadedPlugin>> = self
            .plugins
            .write()
            .await
            .drain()
            .map(|(_, plugin)| plugin)
            .collect();
        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "Shutting down plugins");
        join_all(
            drained
                .iter()
                .map(|plugin| plugin.shutdown(self.shutdown_timeout)),
        )
        .await;
    }

    async fn cached_client(&self, module: &str) -> Option<ProvisionerClient> {
        let plugin = self.plugins.read().await.get(module).cloned()?;
        if plugin.is_alive().await {
            return Some(plugin.client());
        }

        warn!(module = %module, pid = ?plugin.pid(), "Cached plugin is no longer running, evicting");
        self.evict(module, &plugin).await;
        None
    }

    /// Remove `stale` if it is still the entry for `module`.
    async fn evict(&self, module: &str, stale: &Arc<LoadedPlugin>) -> bool {
        let removed = {
            let mut plugins = self.plugins.write().await;
            if plugins.get(module).is_some_and(|p| Arc::ptr_eq(p, stale)) {
                plugins.remove(module)
            } else {
                None
            }
        };

        match removed {
            Some(plugin) => {
                plugin.shutdown(self.shutdown_timeout).await;
                true
            },
            None => false,
        }
    }

    /// Resolve and load `module`. Caller holds the module's load lock.
    async fn load_locked(&self, module: &str) -> PluginResult<ProvisionerClient> {
        // Another caller may have completed the load while we waited.
        if let Some(client) = self.cached_client(module).await {
            return Ok(client);
        }

        let path = self.scanner.resolve(module)?;
        debug!(module = %module, path = %path.display(), "Loading plugin");
        let plugin = Arc::new(self.loader.load(&path).await?);
        let client = plugin.client();

        let previous = self
            .plugins
            .write()
            .await
            .insert(module.to_owned(), plugin);
        if let Some(previous) = previous {
            warn!(module = %module, "Replaced an unexpected cache entry");
            previous.shutdown(self.shutdown_timeout).await;
        }

        Ok(client)
    }

    async fn load_lock(&self, module: &str) -> Arc<Mutex<()>> {
        let mut loading = self.loading.lock().await;
        Arc::clone(loading.entry(module.to_owned()).or_default())
    }

    /// Drop the load lock entry for `module` once no other caller holds it.
    ///
    /// Clones are only taken under the `loading` lock, so a strong count of
    /// two (the map and `flight`) means nobody else is waiting.
    async fn release_load_lock(&self, module: &str, flight: &Arc<Mutex<()>>) {
        let mut loading = self.loading.lock().await;
        let idle = loading
            .get(module)
            .is_some_and(|entry| Arc::ptr_eq(entry, flight) && Arc::strong_count(flight) == 2);
        if idle {
            loading.remove(module);
        }
    }
}

#[async_trait]
impl ClientProvider for PluginManager {
    async fn get_client(&self, module: &str) -> PluginResult<Arc<dyn Provisioner>> {
        let client = PluginManager::get_client(self, module).await?;
        Ok(Arc::new(client))
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("dir", &self.scanner.dir())
            .field("spawns", &self.spawn_count())
            .finish_non_exhaustive()
    }
}
