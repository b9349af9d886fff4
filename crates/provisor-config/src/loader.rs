//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/provisor/config.toml` (system)
//! 3. Merge `~/.provisor/config.toml` (user)
//! 4. Merge `{workspace}/.provisor/config.toml` (workspace)
//! 5. Apply `PROVISOR_*` environment overrides
//! 6. Deserialize merged tree → `Config`
//! 7. Validate

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{deep_merge, set_path};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Environment variable overriding `plugins.dir`.
pub const ENV_PLUGIN_DIR: &str = "PROVISOR_PLUGIN_DIR";
/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "PROVISOR_LOG_LEVEL";
/// Environment variable overriding `worker.concurrency`.
pub const ENV_WORKER_CONCURRENCY: &str = "PROVISOR_WORKER_CONCURRENCY";

/// A validated configuration together with the files that produced it.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Files merged on top of the embedded defaults, lowest priority first.
    pub loaded_files: Vec<String>,
}

/// Load the configuration with layered file precedence.
///
/// `workspace_root` is the root of the current deployment (usually `cwd`).
/// If `None`, the workspace layer is skipped.
///
/// `home_override` replaces the `~/.provisor` directory for user-level
/// config discovery.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, or if the
/// final merged configuration fails validation.
pub fn load(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
) -> ConfigResult<ResolvedConfig> {
    let env_vars: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| k.starts_with("PROVISOR_"))
        .collect();
    load_with_env(workspace_root, home_override, &env_vars)
}

fn load_with_env(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    // 1. Parse embedded defaults.
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut loaded_files = Vec::new();

    // 2. System config.
    let system_path = PathBuf::from("/etc/provisor/config.toml");
    if let Some(overlay) = try_load_file(&system_path)? {
        deep_merge(&mut merged, &overlay);
        info!(path = %system_path.display(), "loaded system config");
        loaded_files.push(system_path.display().to_string());
    }

    // 3. User config. An override points at the `.provisor` directory itself.
    let user_path = match home_override {
        Some(h) => h.join("config.toml"),
        None => home_directory()?.join(".provisor").join("config.toml"),
    };
    if let Some(overlay) = try_load_file(&user_path)? {
        deep_merge(&mut merged, &overlay);
        info!(path = %user_path.display(), "loaded user config");
        loaded_files.push(user_path.display().to_string());
    }

    // 4. Workspace config.
    if let Some(ws_root) = workspace_root {
        let ws_path = ws_root.join(".provisor").join("config.toml");
        if let Some(overlay) = try_load_file(&ws_path)? {
            deep_merge(&mut merged, &overlay);
            info!(path = %ws_path.display(), "loaded workspace config");
            loaded_files.push(ws_path.display().to_string());
        }
    }

    // 5. Environment overrides.
    let env_count = apply_env_overrides(&mut merged, env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment overrides");
    }

    // 6. Deserialize.
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    // 7. Validate.
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
    })
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let Some(value) = try_load_file(path)? else {
        return Err(ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    };

    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;

    validate::validate(&config)?;
    Ok(config)
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// The size is checked on the open handle before reading, and the read
/// itself is capped, so an oversized file is never pulled into memory.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let read_error = |source: std::io::Error| ConfigError::ReadError {
        path: path.display().to_string(),
        source,
    };

    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => return Err(read_error(e)),
    };

    let len = file.metadata().map_err(read_error)?.len();
    if len > MAX_CONFIG_FILE_SIZE {
        return Err(too_large(path, len));
    }

    // The file may grow between the stat and the read.
    let mut content = String::new();
    file.take(MAX_CONFIG_FILE_SIZE.saturating_add(1))
        .read_to_string(&mut content)
        .map_err(read_error)?;
    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(too_large(path, content.len() as u64));
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

fn too_large(path: &Path, len: u64) -> ConfigError {
    ConfigError::ValidationError {
        field: path.display().to_string(),
        message: format!("config file is {len} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"),
    }
}

/// Apply `PROVISOR_*` overrides, returning how many were applied.
fn apply_env_overrides(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut count = 0usize;

    if let Some(dir) = env_vars.get(ENV_PLUGIN_DIR) {
        set_path(merged, "plugins", "dir", toml::Value::String(dir.clone()));
        count = count.saturating_add(1);
    }

    if let Some(level) = env_vars.get(ENV_LOG_LEVEL) {
        set_path(merged, "logging", "level", toml::Value::String(level.clone()));
        count = count.saturating_add(1);
    }

    if let Some(raw) = env_vars.get(ENV_WORKER_CONCURRENCY) {
        let value: i64 = raw.trim().parse().map_err(|_| ConfigError::ValidationError {
            field: ENV_WORKER_CONCURRENCY.to_owned(),
            message: format!("'{raw}' is not an integer"),
        })?;
        set_path(merged, "worker", "concurrency", toml::Value::Integer(value));
        count = count.saturating_add(1);
    }

    Ok(count)
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
