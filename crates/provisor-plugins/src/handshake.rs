//! Host/plugin handshake.
//!
//! The host starts the plugin with `{cookie_key}={cookie_value}` in its
//! environment. The plugin checks the cookie and answers with a single line
//! on stdout:
//!
//! ```text
//! {protocol_version}|{cookie_key}={cookie_value}|jsonrpc
//! ```
//!
//! The host accepts the plugin only if every field matches exactly.

use std::fmt;
use std::time::Duration;

/// Transport name announced in the handshake line.
pub const TRANSPORT: &str = "jsonrpc";

/// Default environment variable carrying the magic cookie.
pub const DEFAULT_COOKIE_KEY: &str = "PROVISOR_PLUGIN_MAGIC_COOKIE";

/// Default magic cookie value.
pub const DEFAULT_COOKIE_VALUE: &str = "3f6b0c1e9a7d4e2b8c5f1a0d6e9b2c7a";

/// Default protocol version.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// The values both sides must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Protocol version.
    pub protocol_version: u32,
    /// Environment variable name.
    pub cookie_key: String,
    /// Environment variable value.
    pub cookie_value: String,
    /// How long the host waits for the handshake line.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            cookie_key: DEFAULT_COOKIE_KEY.to_owned(),
            cookie_value: DEFAULT_COOKIE_VALUE.to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl HandshakeConfig {
    /// Create a handshake config with the default timeout.
    #[must_use]
    pub fn new(
        protocol_version: u32,
        cookie_key: impl Into<String>,
        cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            cookie_key: cookie_key.into(),
            cookie_value: cookie_value.into(),
            ..Self::default()
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The line a conforming plugin prints.
    #[must_use]
    pub fn line(&self) -> HandshakeLine {
        HandshakeLine {
            protocol_version: self.protocol_version,
            cookie_key: self.cookie_key.clone(),
            cookie_value: self.cookie_value.clone(),
            transport: TRANSPORT.to_owned(),
        }
    }

    /// Check a line received from a plugin.
    ///
    /// # Errors
    ///
    /// Returns a description of the first mismatching field.
    pub fn check(&self, raw: &str) -> Result<HandshakeLine, String> {
        let line = HandshakeLine::parse(raw)?;

        if line.protocol_version != self.protocol_version {
            return Err(format!(
                "protocol version mismatch: host speaks {}, plugin speaks {}",
                self.protocol_version, line.protocol_version
            ));
        }
        if line.cookie_key != self.cookie_key || line.cookie_value != self.cookie_value {
            return Err("magic cookie mismatch".to_owned());
        }
        if line.transport != TRANSPORT {
            return Err(format!(
                "unsupported transport '{}', expected '{TRANSPORT}'",
                line.transport
            ));
        }

        Ok(line)
    }

    /// Whether `value` (the plugin's view of its environment) carries the
    /// expected cookie.
    #[must_use]
    pub fn cookie_matches(&self, value: Option<&str>) -> bool {
        value == Some(self.cookie_value.as_str())
    }
}

/// A parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    /// Announced protocol version.
    pub protocol_version: u32,
    /// Echoed cookie key.
    pub cookie_key: String,
    /// Echoed cookie value.
    pub cookie_value: String,
    /// Announced transport.
    pub transport: String,
}

impl HandshakeLine {
    /// Parse a raw line. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns a description of the malformed part.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let mut parts = trimmed.split('|');

        let (Some(version), Some(cookie), Some(transport), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("malformed handshake line: {trimmed:?}"));
        };

        let protocol_version = version
            .parse::<u32>()
            .map_err(|_| format!("invalid protocol version: {version:?}"))?;

        let (cookie_key, cookie_value) = cookie
            .split_once('=')
            .ok_or_else(|| format!("malformed magic cookie: {cookie:?}"))?;

        Ok(Self {
            protocol_version,
            cookie_key: cookie_key.to_owned(),
            cookie_value: cookie_value.to_owned(),
            transport: transport.to_owned(),
        })
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}={}|{}",
            self.protocol_version, self.cookie_key, self.cookie_value, self.transport
        )
    }
}
