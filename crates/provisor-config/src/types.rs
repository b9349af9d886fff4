//! Configuration types for provisor.
//!
//! Every struct implements [`Default`] with the same values as the embedded
//! `defaults.toml`, so a bare `[section]` header in TOML produces a working
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin discovery, handshake and RPC settings.
    pub plugins: PluginsSection,
    /// Task worker pool and retry policy.
    pub worker: WorkerSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Where provisioner binaries live and how the host talks to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directory scanned for provisioner executables.
    pub dir: PathBuf,
    /// Protocol version both sides must agree on.
    pub protocol_version: u32,
    /// Environment variable name carrying the magic cookie.
    pub magic_cookie_key: String,
    /// Expected magic cookie value.
    pub magic_cookie_value: String,
    /// How long a freshly spawned plugin has to complete the handshake.
    pub handshake_timeout_ms: u64,
    /// Deadline applied to each provisioning RPC issued by the worker.
    pub rpc_timeout_ms: u64,
    /// Grace period when killing plugin processes on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl PluginsSection {
    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// RPC timeout as a [`Duration`].
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Shutdown timeout as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./plugins"),
            protocol_version: 1,
            magic_cookie_key: "PROVISOR_PLUGIN_MAGIC_COOKIE".to_owned(),
            magic_cookie_value: "3f6b0c1e9a7d4e2b8c5f1a0d6e9b2c7a".to_owned(),
            handshake_timeout_ms: 10_000,
            rpc_timeout_ms: 60_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerSection
// ---------------------------------------------------------------------------

/// Task worker pool and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Number of tasks processed concurrently.
    pub concurrency: usize,
    /// Retries allowed after the first failed attempt before a task is dead.
    pub max_retries: u32,
    /// Base delay multiplied by `2^n` for retry `n`.
    pub backoff_base_ms: u64,
    /// Upper bound on any single retry delay.
    pub backoff_ceiling_secs: u64,
    /// Exponent cap applied to the retry count.
    pub backoff_max_exponent: u32,
}

impl WorkerSection {
    /// Base backoff delay as a [`Duration`].
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff ceiling as a [`Duration`].
    #[must_use]
    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 25,
            backoff_base_ms: 1_000,
            backoff_ceiling_secs: 600,
            backoff_max_exponent: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format (`pretty`, `compact`, `json`).
    pub format: String,
    /// Extra `EnvFilter` directives, e.g. `provisor_plugins=debug`.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}
