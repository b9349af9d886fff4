//! Bridge from `provisor_config::Config` to domain types.

use provisor_config::Config;
use provisor_plugins::{HandshakeConfig, PluginLoader, PluginManager, PluginScanner};
use provisor_telemetry::{LogConfig, LogFormat, LogTarget};

/// Logging setup for the CLI. `verbose` forces `debug`.
///
/// Logs go to stderr so command output stays clean on stdout.
pub(crate) fn to_log_config(config: &Config, verbose: bool) -> LogConfig {
    let mut log = LogConfig::try_from(&config.logging)
        .unwrap_or_else(|_| LogConfig::new("warn").with_format(LogFormat::Compact));
    if verbose {
        "debug".clone_into(&mut log.level);
    }
    log.with_target(LogTarget::Stderr)
}

/// Handshake values from the `[plugins]` section.
pub(crate) fn to_handshake(config: &Config) -> HandshakeConfig {
    let plugins = &config.plugins;
    HandshakeConfig::new(
        plugins.protocol_version,
        plugins.magic_cookie_key.clone(),
        plugins.magic_cookie_value.clone(),
    )
    .with_timeout(plugins.handshake_timeout())
}

/// A plugin manager over the configured directory.
pub(crate) fn to_manager(config: &Config) -> PluginManager {
    PluginManager::new(
        PluginScanner::new(config.plugins.dir.clone()),
        PluginLoader::new(to_handshake(config)),
    )
    .with_shutdown_timeout(config.plugins.shutdown_timeout())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_handshake_from_config() {
        let mut config = Config::default();
        config.plugins.protocol_version = 3;
        config.plugins.magic_cookie_key = "HOST_COOKIE".into();
        config.plugins.magic_cookie_value = "abc".into();
        config.plugins.handshake_timeout_ms = 2500;

        let handshake = to_handshake(&config);
        assert_eq!(handshake.protocol_version, 3);
        assert_eq!(handshake.cookie_key, "HOST_COOKIE");
        assert_eq!(handshake.cookie_value, "abc");
        assert_eq!(handshake.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_verbose_forces_debug() {
        let config = Config::default();
        assert_eq!(to_log_config(&config, true).level, "debug");
        assert_eq!(to_log_config(&config, false).level, config.logging.level);
    }

    #[test]
    fn test_manager_uses_plugin_dir() {
        let mut config = Config::default();
        config.plugins.dir = "/srv/provisor/plugins".into();
        let manager = to_manager(&config);
        assert_eq!(
            manager.scanner().dir(),
            std::path::Path::new("/srv/provisor/plugins")
        );
    }
}
