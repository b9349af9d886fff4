//! Plugin commands: list, verify, checksum and probe.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, bail};
use provisor_config::Config;
use provisor_plugins::{
    CallContext, PluginError, PluginScanner, Provisioner, module_name, sidecar_path,
    verify_checksum, write_sidecar,
};
use tracing::debug;

use crate::config_bridge;
use crate::theme::Theme;

/// Checksum state of one binary, as shown by `plugins list`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SidecarStatus {
    /// Digest matches.
    Verified,
    /// No sidecar next to the binary.
    Missing,
    /// Sidecar present but the check failed.
    Invalid(String),
}

pub(crate) fn sidecar_status(binary: &Path) -> SidecarStatus {
    if !sidecar_path(binary).exists() {
        return SidecarStatus::Missing;
    }
    match verify_checksum(binary) {
        Ok(()) => SidecarStatus::Verified,
        Err(PluginError::Integrity { message, .. }) => SidecarStatus::Invalid(message),
        Err(e) => SidecarStatus::Invalid(e.to_string()),
    }
}

/// `provisor plugins list`
pub(crate) fn list(config: &Config) -> anyhow::Result<()> {
    let scanner = PluginScanner::new(config.plugins.dir.clone());
    let binaries = scanner
        .scan()
        .with_context(|| format!("failed to scan {}", scanner.dir().display()))?;

    println!(
        "{}",
        Theme::header(&format!("Plugins in {}", scanner.dir().display()))
    );
    if binaries.is_empty() {
        println!("  {}", Theme::dimmed("(none)"));
        return Ok(());
    }

    for binary in &binaries {
        let name = module_name(binary).unwrap_or_default();
        let line = match sidecar_status(binary) {
            SidecarStatus::Verified => Theme::success(&name),
            SidecarStatus::Missing => Theme::warning(&format!("{name} (no checksum sidecar)")),
            SidecarStatus::Invalid(reason) => Theme::error(&format!("{name} ({reason})")),
        };
        println!("  {line}");
    }
    Ok(())
}

/// `provisor plugins verify <module>`
pub(crate) fn verify(config: &Config, module: &str) -> anyhow::Result<()> {
    let scanner = PluginScanner::new(config.plugins.dir.clone());
    let path = scanner.resolve(module)?;
    debug!(module = %module, path = %path.display(), "Verifying plugin");

    match verify_checksum(&path) {
        Ok(()) => {
            println!(
                "{}",
                Theme::success(&format!("{module}: {} verified", path.display()))
            );
            Ok(())
        },
        Err(e) => {
            println!("{}", Theme::error(&format!("{module}: {e}")));
            bail!("integrity check failed for module '{module}'")
        },
    }
}

/// `provisor plugins checksum <path>`
pub(crate) fn checksum(path: &Path) -> anyhow::Result<()> {
    let digest = write_sidecar(path)
        .with_context(|| format!("failed to write sidecar for {}", path.display()))?;
    println!(
        "{}",
        Theme::success(&format!("{}  {digest}", sidecar_path(path).display()))
    );
    Ok(())
}

/// `provisor plugins probe <module>`
pub(crate) async fn probe(config: &Config, module: &str) -> anyhow::Result<()> {
    let manager = config_bridge::to_manager(config);
    let started = Instant::now();

    let result = async {
        let client = manager.get_client(module).await?;
        let loaded_in = started.elapsed();
        let ctx = CallContext::with_timeout(config.plugins.rpc_timeout());
        let pong = client.ping(&ctx).await?;
        Ok::<_, PluginError>((loaded_in, pong.message))
    }
    .await;

    manager.shutdown_all().await;

    match result {
        Ok((loaded_in, message)) => {
            println!(
                "{}",
                Theme::success(&format!(
                    "{module}: loaded in {}ms, ping answered '{message}'",
                    loaded_in.as_millis()
                ))
            );
            Ok(())
        },
        Err(e) => {
            println!("{}", Theme::error(&format!("{module}: {e}")));
            bail!("probe failed for module '{module}'")
        },
    }
}
