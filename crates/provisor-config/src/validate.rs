//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound on worker concurrency.
const MAX_CONCURRENCY: usize = 1024;

/// Upper bound on the backoff exponent; `2^30` seconds is already decades.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_worker(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let p = &config.plugins;

    if p.dir.as_os_str().is_empty() {
        return Err(invalid("plugins.dir", "plugin directory must not be empty"));
    }

    if p.protocol_version == 0 {
        return Err(invalid(
            "plugins.protocol_version",
            "protocol version must be at least 1",
        ));
    }

    if p.magic_cookie_key.trim().is_empty() {
        return Err(invalid(
            "plugins.magic_cookie_key",
            "magic cookie key must not be empty",
        ));
    }

    if p.magic_cookie_key.contains('=') || p.magic_cookie_key.contains('\0') {
        return Err(invalid(
            "plugins.magic_cookie_key",
            "magic cookie key must be a valid environment variable name",
        ));
    }

    if p.magic_cookie_value.is_empty() {
        return Err(invalid(
            "plugins.magic_cookie_value",
            "magic cookie value must not be empty",
        ));
    }

    if p.magic_cookie_value.contains('|') || p.magic_cookie_value.contains('\n') {
        return Err(invalid(
            "plugins.magic_cookie_value",
            "magic cookie value must not contain '|' or newlines",
        ));
    }

    for (field, value) in [
        ("plugins.handshake_timeout_ms", p.handshake_timeout_ms),
        ("plugins.rpc_timeout_ms", p.rpc_timeout_ms),
        ("plugins.shutdown_timeout_ms", p.shutdown_timeout_ms),
    ] {
        if value == 0 {
            return Err(invalid(field, "timeout must be greater than zero"));
        }
    }

    Ok(())
}

fn validate_worker(config: &Config) -> ConfigResult<()> {
    let w = &config.worker;

    if w.concurrency == 0 || w.concurrency > MAX_CONCURRENCY {
        return Err(invalid(
            "worker.concurrency",
            format!("concurrency must be between 1 and {MAX_CONCURRENCY}"),
        ));
    }

    if w.backoff_base_ms == 0 {
        return Err(invalid(
            "worker.backoff_base_ms",
            "base delay must be greater than zero",
        ));
    }

    if w.backoff_base() > w.backoff_ceiling() {
        return Err(invalid(
            "worker.backoff_ceiling_secs",
            "ceiling must not be below the base delay",
        ));
    }

    if w.backoff_max_exponent > MAX_BACKOFF_EXPONENT {
        return Err(invalid(
            "worker.backoff_max_exponent",
            format!("exponent must be at most {MAX_BACKOFF_EXPONENT}"),
        ));
    }

    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;

    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        ));
    }

    if !matches!(l.format.as_str(), "pretty" | "compact" | "json") {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json",
                l.format
            ),
        ));
    }

    Ok(())
}
