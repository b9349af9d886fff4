//! Plugin error types.

use std::path::PathBuf;

/// Errors from plugin discovery, loading and RPC.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The checksum sidecar is missing, unreadable, malformed, or does not
    /// match the binary. The binary was not executed.
    #[error("integrity check failed for {path}: {message}")]
    Integrity {
        /// The plugin binary.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// No binary in the plugin directory matches the module name.
    #[error("cannot resolve module '{module}' in {dir}: {message}")]
    Resolution {
        /// The requested module name.
        module: String,
        /// The directory that was searched.
        dir: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// The child did not complete the protocol-version and magic-cookie
    /// handshake. The child has been killed.
    #[error("handshake with {path} failed: {message}")]
    Handshake {
        /// The plugin binary.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// The plugin process could not be started.
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        /// The plugin binary.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The plugin answered the call with an error.
    #[error("{method} failed (code {code}): {message}")]
    Rpc {
        /// The RPC method that failed.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// Message reported by the plugin.
        message: String,
    },

    /// The call did not complete before its deadline.
    #[error("{method} exceeded its deadline")]
    DeadlineExceeded {
        /// The RPC method that timed out.
        method: String,
    },

    /// The caller cancelled the call.
    #[error("{method} was cancelled")]
    Cancelled {
        /// The RPC method that was cancelled.
        method: String,
    },

    /// The plugin's stdio channel is closed, usually because the process exited.
    #[error("channel to plugin '{module}' is closed")]
    ChannelClosed {
        /// The module whose channel closed.
        module: String,
    },

    /// A frame on the wire could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Build an application error, as returned by a provisioner implementation.
    #[must_use]
    pub fn application(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            code: crate::jsonrpc::APPLICATION_ERROR,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can never succeed without operator
    /// action (integrity, resolution and handshake failures).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. } | Self::Resolution { .. } | Self::Handshake { .. }
        )
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let integrity = PluginError::Integrity {
            path: PathBuf::from("/p/vps"),
            message: "missing sidecar".into(),
        };
        let handshake = PluginError::Handshake {
            path: PathBuf::from("/p/vps"),
            message: "cookie mismatch".into(),
        };
        let rpc = PluginError::application("provisioner.create_service", "quota exceeded");
        let closed = PluginError::ChannelClosed {
            module: "vps".into(),
        };

        assert!(integrity.is_fatal());
        assert!(handshake.is_fatal());
        assert!(!rpc.is_fatal());
        assert!(!closed.is_fatal());
    }

    #[test]
    fn test_application_error_display() {
        let err = PluginError::application("provisioner.suspend", "node offline");
        assert_eq!(
            err.to_string(),
            "provisioner.suspend failed (code -32000): node offline"
        );
    }
}
