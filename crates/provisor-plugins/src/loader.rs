//! Plugin loading: verify, spawn, handshake, open the RPC channel.
//!
//! The binary is never executed before its checksum sidecar has been
//! verified. Once spawned, the child is owned by a [`ChildGuard`] so that
//! every failure path kills it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::RpcChannel;
use crate::client::ProvisionerClient;
use crate::error::{PluginError, PluginResult};
use crate::handshake::HandshakeConfig;
use crate::integrity::verify_checksum;
use crate::scanner::module_name;

/// Grace period used when a failed load kills its child.
const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Spawn attempts retried while the freshly written binary is still open
/// for writing somewhere (`ETXTBSY`).
const SPAWN_BUSY_RETRIES: u32 = 5;

/// Kills the wrapped child process when dropped.
pub(crate) struct ChildGuard {
    child: Child,
    module: String,
}

impl ChildGuard {
    pub(crate) fn new(child: Child, module: impl Into<String>) -> Self {
        Self {
            child,
            module: module.into(),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn take_stdio(
        &mut self,
    ) -> (Option<ChildStdin>, Option<ChildStdout>, Option<ChildStderr>) {
        (
            self.child.stdin.take(),
            self.child.stdout.take(),
            self.child.stderr.take(),
        )
    }

    /// Whether the process has exited. Reaps it if so.
    pub(crate) fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(module = %self.module, %status, "Plugin process has exited");
                true
            },
            Ok(None) => false,
            Err(e) => {
                warn!(module = %self.module, error = %e, "Failed to poll plugin process");
                true
            },
        }
    }

    /// Kill the process and wait up to `grace` for it to be reaped.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        if let Err(e) = self.child.start_kill() {
            debug!(module = %self.module, error = %e, "Kill skipped, process already gone");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(module = %self.module, %status, "Plugin process reaped"),
            Ok(Err(e)) => warn!(module = %self.module, error = %e, "Failed to reap plugin process"),
            Err(_) => warn!(module = %self.module, "Plugin process did not exit within grace period"),
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.start_kill();
        }
    }
}

/// A running plugin: its process and its RPC channel.
///
/// Dropping a `LoadedPlugin` kills the process.
pub struct LoadedPlugin {
    module: String,
    path: PathBuf,
    pid: Option<u32>,
    loaded_at: DateTime<Utc>,
    channel: Arc<RpcChannel>,
    process: Mutex<ChildGuard>,
}

impl LoadedPlugin {
    /// Module name served by this plugin.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Path of the binary.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OS process id at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the handshake completed.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// A client bound to this plugin's channel.
    #[must_use]
    pub fn client(&self) -> ProvisionerClient {
        ProvisionerClient::new(Arc::clone(&self.channel))
    }

    /// Whether the channel is open and the process is still running.
    pub async fn is_alive(&self) -> bool {
        if self.channel.is_closed() {
            return false;
        }
        !self.process.lock().await.has_exited()
    }

    /// Close the channel and kill the process.
    pub async fn shutdown(&self, grace: Duration) {
        self.channel.close();
        self.process.lock().await.terminate(grace).await;
        info!(module = %self.module, pid = ?self.pid, "Plugin unloaded");
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("module", &self.module)
            .field("path", &self.path)
            .field("pid", &self.pid)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Verifies, launches and handshakes plugin binaries.
#[derive(Debug, Default)]
pub struct PluginLoader {
    handshake: HandshakeConfig,
    spawns: AtomicUsize,
}

impl PluginLoader {
    /// Create a loader using `handshake` for every plugin.
    #[must_use]
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            spawns: AtomicUsize::new(0),
        }
    }

    /// The handshake configuration.
    #[must_use]
    pub fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    /// Number of processes this loader has started.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Verify the binary's checksum sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Integrity`] on any verification failure.
    pub fn verify_checksum(&self, path: &Path) -> PluginResult<()> {
        verify_checksum(path)
    }

    /// Verify, spawn and handshake the plugin at `path`.
    ///
    /// The child runs with no arguments and the magic cookie in its
    /// environment. If anything fails after the spawn, the child is killed
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Integrity`] if the checksum does not verify. Nothing
    ///   is executed.
    /// - [`PluginError::Spawn`] if the process cannot be started.
    /// - [`PluginError::Handshake`] if the child does not complete the
    ///   handshake in time or announces mismatching values.
    pub async fn load(&self, path: &Path) -> PluginResult<LoadedPlugin> {
        let module = module_name(path).unwrap_or_else(|| path.display().to_string());

        self.verify_checksum(path)?;
        debug!(module = %module, path = %path.display(), "Checksum verified");

        let mut cmd = Command::new(path);
        cmd.env(&self.handshake.cookie_key, &self.handshake.cookie_value)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = spawn_retrying(&mut cmd)
            .await
            .map_err(|source| PluginError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let mut guard = ChildGuard::new(child, module.clone());
        let pid = guard.pid();
        debug!(module = %module, pid = ?pid, "Plugin process spawned");

        match self.establish(&module, path, &mut guard).await {
            Ok(channel) => {
                info!(module = %module, path = %path.display(), pid = ?pid, "Plugin loaded");
                Ok(LoadedPlugin {
                    module,
                    path: path.to_path_buf(),
                    pid,
                    loaded_at: Utc::now(),
                    channel: Arc::new(channel),
                    process: Mutex::new(guard),
                })
            },
            Err(e) => {
                warn!(module = %module, pid = ?pid, error = %e, "Plugin load failed, killing process");
                guard.terminate(ABORT_GRACE).await;
                Err(e)
            },
        }
    }

    async fn establish(
        &self,
        module: &str,
        path: &Path,
        guard: &mut ChildGuard,
    ) -> PluginResult<RpcChannel> {
        let handshake_error = |message: String| PluginError::Handshake {
            path: path.to_path_buf(),
            message,
        };

        let (stdin, stdout, stderr) = guard.take_stdio();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(handshake_error("plugin stdio was not captured".to_owned()));
        };
        if let Some(stderr) = stderr {
            forward_stderr(module.to_owned(), stderr);
        }

        let mut lines = BufReader::new(stdout).lines();
        let line = match tokio::time::timeout(self.handshake.timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(handshake_error(
                    "plugin exited before completing the handshake".to_owned(),
                ));
            },
            Ok(Err(e)) => return Err(handshake_error(format!("failed to read handshake: {e}"))),
            Err(_) => {
                return Err(handshake_error(format!(
                    "no handshake within {}ms",
                    self.handshake.timeout.as_millis()
                )));
            },
        };

        let accepted = self.handshake.check(&line).map_err(handshake_error)?;
        debug!(
            module = %module,
            protocol_version = accepted.protocol_version,
            transport = %accepted.transport,
            "Handshake accepted"
        );

        Ok(RpcChannel::start(module, lines, stdin))
    }
}

async fn spawn_retrying(cmd: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0u32;
    loop {
        match cmd.spawn() {
            Err(e)
                if e.kind() == std::io::ErrorKind::ExecutableFileBusy
                    && attempt < SPAWN_BUSY_RETRIES =>
            {
                attempt = attempt.saturating_add(1);
                debug!(attempt, "Plugin binary busy, retrying spawn");
                tokio::time::sleep(Duration::from_millis(25)).await;
            },
            result => return result,
        }
    }
}

/// Re-emit the plugin's stderr as tracing events.
fn forward_stderr(module: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "provisor_plugins::stderr", module = %module, "{line}");
        }
    });
}
