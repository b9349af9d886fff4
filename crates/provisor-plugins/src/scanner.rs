//! Plugin directory scanning and module-name resolution.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::integrity::SIDECAR_EXTENSION;

/// Enumerates provisioner executables in a single directory.
#[derive(Debug, Clone)]
pub struct PluginScanner {
    dir: PathBuf,
}

impl PluginScanner {
    /// Create a scanner rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The scanned directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List regular, executable files directly under the directory.
    ///
    /// Directories, non-executable files and checksum sidecars are skipped.
    /// Entries that cannot be inspected are logged and skipped. The result
    /// is sorted by path.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the directory itself cannot be read.
    pub fn scan(&self) -> PluginResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)?;
        let mut found = Vec::new();

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Failed to read plugin dir entry");
                    continue;
                },
            };
            let path = entry.path();

            if is_sidecar(&path) {
                continue;
            }

            match is_executable_file(&path) {
                Ok(true) => found.push(path),
                Ok(false) => debug!(path = %path.display(), "Skipping non-executable entry"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to inspect plugin candidate");
                },
            }
        }

        found.sort();
        debug!(dir = %self.dir.display(), count = found.len(), "Scanned plugin directory");
        Ok(found)
    }

    /// Resolve a module name to a binary path.
    ///
    /// An exact file name match wins. Otherwise the scanned candidates are
    /// matched on their file name or their extension-stripped stem. More than
    /// one stem match is ambiguous and rejected.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Resolution`] when nothing matches, the match is
    /// ambiguous, or the module name is not a plain file name.
    pub fn resolve(&self, module: &str) -> PluginResult<PathBuf> {
        if !is_plain_file_name(module) {
            return Err(self.resolution_error(module, "module name is not a plain file name"));
        }

        let exact = self.dir.join(module);
        if !is_sidecar(&exact) && is_executable_file(&exact).unwrap_or(false) {
            return Ok(exact);
        }

        let candidates = self.scan().map_err(|e| {
            self.resolution_error(module, format!("cannot scan plugin directory: {e}"))
        })?;

        let mut matches = candidates
            .into_iter()
            .filter(|path| {
                path.file_name().is_some_and(|n| n == module)
                    || path.file_stem().is_some_and(|s| s == module)
            })
            .collect::<Vec<_>>();

        match matches.len() {
            0 => Err(self.resolution_error(module, "no matching plugin binary")),
            1 => Ok(matches.remove(0)),
            _ => {
                let names = matches
                    .iter()
                    .filter_map(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(self.resolution_error(module, format!("ambiguous match: {names}")))
            },
        }
    }

    fn resolution_error(&self, module: &str, message: impl Into<String>) -> PluginError {
        PluginError::Resolution {
            module: module.to_owned(),
            dir: self.dir.clone(),
            message: message.into(),
        }
    }
}

/// The module name a binary serves: its file name without the extension.
#[must_use]
pub fn module_name(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn is_sidecar(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SIDECAR_EXTENSION)
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path)?;
    Ok(meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> std::io::Result<bool> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.is_file())
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_scan_filters_entries() {
        let dir = tempfile::tempdir().unwrap();
        let vps = touch(dir.path(), "vps", 0o755);
        let cpanel = touch(dir.path(), "cpanel.sh", 0o700);
        touch(dir.path(), "README", 0o644);
        touch(dir.path(), "vps.sha256", 0o755);
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested"), "hidden", 0o755);

        let found = PluginScanner::new(dir.path()).scan().unwrap();
        assert_eq!(found, vec![cpanel, vps]);
    }

    #[test]
    fn test_scan_missing_dir() {
        let result = PluginScanner::new("/nonexistent/plugins").scan();
        assert!(matches!(result, Err(PluginError::Io(_))));
    }

    #[test]
    fn test_resolve_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let vps = touch(dir.path(), "vps", 0o755);
        touch(dir.path(), "vps.py", 0o755);

        let resolved = PluginScanner::new(dir.path()).resolve("vps").unwrap();
        assert_eq!(resolved, vps);
    }

    #[test]
    fn test_resolve_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let proxmox = touch(dir.path(), "proxmox.bin", 0o755);

        let resolved = PluginScanner::new(dir.path()).resolve("proxmox").unwrap();
        assert_eq!(resolved, proxmox);
    }

    #[test]
    fn test_resolve_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "vps", 0o755);
        touch(dir.path(), "cpanel", 0o755);

        let err = PluginScanner::new(dir.path()).resolve("plesk").unwrap_err();
        assert!(matches!(err, PluginError::Resolution { ref module, .. } if module == "plesk"));
    }

    #[test]
    fn test_resolve_ignores_non_executable_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "vps", 0o644);

        let err = PluginScanner::new(dir.path()).resolve("vps").unwrap_err();
        assert!(matches!(err, PluginError::Resolution { .. }));
    }

    #[test]
    fn test_resolve_never_returns_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "vps", 0o755);
        touch(dir.path(), "vps.sha256", 0o755);

        let err = PluginScanner::new(dir.path())
            .resolve("vps.sha256")
            .unwrap_err();
        assert!(matches!(err, PluginError::Resolution { .. }));
    }

    #[test]
    fn test_resolve_ambiguous_stem() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "dns.sh", 0o755);
        touch(dir.path(), "dns.py", 0o755);

        let err = PluginScanner::new(dir.path()).resolve("dns").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_resolve_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "vps", 0o755);

        let scanner = PluginScanner::new(dir.path());
        for bad in ["", "..", "../vps", "sub/vps"] {
            assert!(
                matches!(scanner.resolve(bad), Err(PluginError::Resolution { .. })),
                "{bad:?} should not resolve"
            );
        }
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("/p/vps.bin")).as_deref(), Some("vps"));
        assert_eq!(module_name(Path::new("/p/cpanel")).as_deref(), Some("cpanel"));
    }
}
