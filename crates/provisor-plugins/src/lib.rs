#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Provisioner plugins for provisor.
//!
//! A provisioner is a standalone executable living in the plugin directory,
//! next to a `<binary>.sha256` checksum sidecar. The host:
//!
//! 1. **Resolves** a product's module name to a binary ([`PluginScanner`]).
//! 2. **Verifies** the binary against its sidecar before executing it
//!    ([`verify_checksum`]).
//! 3. **Spawns** it with the magic cookie in its environment and waits for
//!    the handshake line ([`PluginLoader`], [`HandshakeConfig`]).
//! 4. **Calls** it over newline-delimited JSON-RPC on stdin/stdout
//!    ([`ProvisionerClient`]).
//!
//! [`PluginManager`] caches one live process per module and guarantees that
//! concurrent first requests for the same module spawn it only once.
//!
//! Plugin authors implement [`Provisioner`] and hand it to [`serve`].
//!
//! # Example
//!
//! ```rust,no_run
//! use provisor_plugins::{CallContext, HandshakeConfig, PluginLoader, PluginManager, PluginScanner, Provisioner};
//!
//! # async fn example() -> provisor_plugins::PluginResult<()> {
//! let manager = PluginManager::new(
//!     PluginScanner::new("/var/lib/provisor/plugins"),
//!     PluginLoader::new(HandshakeConfig::default()),
//! );
//! let client = manager.get_client("vps").await?;
//! client.ping(&CallContext::new()).await?;
//! manager.shutdown_all().await;
//! # Ok(())
//! # }
//! ```

/// Multiplexed request/response channel over plugin stdio.
pub mod channel;
/// Host-side provisioner client.
pub mod client;
/// Plugin error types.
pub mod error;
/// Protocol-version and magic-cookie handshake.
pub mod handshake;
/// Checksum sidecar verification.
pub mod integrity;
/// JSON-RPC frame types.
pub mod jsonrpc;
/// Process spawning and handshake.
pub mod loader;
/// Cached, single-flight plugin manager.
pub mod manager;
/// Provisioner operations and wire types.
pub mod protocol;
/// Plugin directory scanning and module resolution.
pub mod scanner;
/// Plugin-side serve loop.
pub mod sdk;

pub use channel::RpcChannel;
pub use client::ProvisionerClient;
pub use error::{PluginError, PluginResult};
pub use handshake::{HandshakeConfig, HandshakeLine};
pub use integrity::{sha256_file, sidecar_path, verify_checksum, write_sidecar};
pub use loader::{LoadedPlugin, PluginLoader};
pub use manager::{ClientProvider, PluginManager};
pub use protocol::{
    CallContext, CallParams, ChangePackageRequest, CreateServiceRequest, CreateServiceResponse,
    GetUsageRequest, GetUsageResponse, MessageResponse, Method, PowerAction, PowerControlRequest,
    Provisioner, SuspendRequest, TerminateRequest, UsageMetric,
};
pub use scanner::{PluginScanner, module_name};
pub use sdk::{serve, serve_io};
