//! Subscriber configuration and installation.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-oriented output.
    #[default]
    Pretty,
    /// Single-line output.
    Compact,
    /// Newline-delimited JSON, one object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(TelemetryError::ConfigError(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    /// Standard error. Keeps stdout free for command output.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level filter, e.g. `info`.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
    /// Extra `EnvFilter` directives such as `provisor_plugins=debug`.
    pub directives: Vec<String>,
    /// Output stream.
    pub target: LogTarget,
    /// Emit ANSI colour codes.
    pub ansi: bool,
    /// Let `RUST_LOG` replace `level` when it is set.
    pub respect_env: bool,
}

impl LogConfig {
    /// Create a config with the given default level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            directives: Vec::new(),
            target: LogTarget::default(),
            ansi: true,
            respect_env: true,
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Add a filter directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Set the output stream.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Enable or disable ANSI colours.
    #[must_use]
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Build the `EnvFilter` described by this config.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ConfigError`] if the level or a directive
    /// does not parse.
    pub fn env_filter(&self) -> TelemetryResult<EnvFilter> {
        let base = match std::env::var("RUST_LOG") {
            Ok(from_env) if self.respect_env && !from_env.trim().is_empty() => from_env,
            _ => self.level.clone(),
        };

        let mut filter = EnvFilter::try_new(&base)
            .map_err(|e| TelemetryError::ConfigError(format!("invalid level '{base}': {e}")))?;

        for directive in &self.directives {
            let parsed = directive.parse().map_err(|e| {
                TelemetryError::ConfigError(format!("invalid directive '{directive}': {e}"))
            })?;
            filter = filter.add_directive(parsed);
        }

        Ok(filter)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

#[cfg(feature = "config")]
impl TryFrom<&provisor_config::LoggingSection> for LogConfig {
    type Error = TelemetryError;

    fn try_from(section: &provisor_config::LoggingSection) -> Result<Self, Self::Error> {
        let mut config = Self::new(section.level.to_ascii_lowercase())
            .with_format(section.format.parse()?);
        config.directives.clone_from(&section.directives);
        Ok(config)
    }
}

/// Install a global subscriber built from `config`.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber has
/// already been installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.env_filter()?;
    match config.target {
        LogTarget::Stderr => install(config, filter, std::io::stderr),
        LogTarget::Stdout => install(config, filter, std::io::stdout),
    }
}

/// Install a pretty `info` subscriber on stderr.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed.
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}

fn install<W>(config: &LogConfig, filter: EnvFilter, writer: W) -> TelemetryResult<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.ansi && config.format != LogFormat::Json);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| TelemetryError::InitError(e.to_string()))
}
