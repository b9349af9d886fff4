use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be parsed as TOML or did not match the schema.
    #[error("failed to parse {path}: {source}")]
    ParseError {
        /// Path (or pseudo-path) of the offending document.
        path: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A config file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    ReadError {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A field holds a value outside its accepted range.
    #[error("invalid value for {field}: {message}")]
    ValidationError {
        /// Dotted path of the field, e.g. `plugins.dir`.
        field: String,
        /// Human-readable reason.
        message: String,
    },

    /// The user's home directory could not be determined.
    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
