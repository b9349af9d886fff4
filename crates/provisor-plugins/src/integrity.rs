//! SHA-256 checksum sidecar verification.
//!
//! Every plugin binary must have a sibling `<binary>.sha256` file whose first
//! whitespace-delimited token is the hex digest of the binary. Anything after
//! that token is ignored, so `sha256sum` output works as-is.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{PluginError, PluginResult};

/// Extension of the checksum sidecar.
pub const SIDECAR_EXTENSION: &str = "sha256";

/// Path of the checksum sidecar for `binary`.
#[must_use]
pub fn sidecar_path(binary: &Path) -> PathBuf {
    let mut name = OsString::from(binary.as_os_str());
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Compute the lowercase hex SHA-256 digest of a file.
///
/// # Errors
///
/// Returns [`PluginError::Io`] if the file cannot be read.
pub fn sha256_file(path: &Path) -> PluginResult<String> {
    Ok(hex::encode(digest_file(path)?))
}

/// Stream `path` through the hasher without loading it into memory.
fn digest_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Write a `sha256sum`-style sidecar for `binary` and return the digest.
///
/// # Errors
///
/// Returns [`PluginError::Io`] if the binary cannot be read or the sidecar
/// cannot be written.
pub fn write_sidecar(binary: &Path) -> PluginResult<String> {
    let digest = sha256_file(binary)?;
    let file_name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::fs::write(sidecar_path(binary), format!("{digest}  {file_name}\n"))?;
    Ok(digest)
}

/// Verify `binary` against its checksum sidecar.
///
/// The comparison is case-insensitive on the hex digest and constant-time on
/// the decoded bytes.
///
/// # Errors
///
/// Returns [`PluginError::Integrity`] if the sidecar is missing, unreadable,
/// empty or malformed, if the binary cannot be read, or if the digests differ.
pub fn verify_checksum(binary: &Path) -> PluginResult<()> {
    let integrity = |message: String| PluginError::Integrity {
        path: binary.to_path_buf(),
        message,
    };

    let sidecar = sidecar_path(binary);
    let contents = std::fs::read_to_string(&sidecar)
        .map_err(|e| integrity(format!("cannot read {}: {e}", sidecar.display())))?;

    let token = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| integrity(format!("{} is empty", sidecar.display())))?;

    let expected = hex::decode(token)
        .map_err(|e| integrity(format!("{} is not a hex digest: {e}", sidecar.display())))?;
    if expected.len() != Sha256::output_size() {
        return Err(integrity(format!(
            "{} holds a {}-byte digest, expected {}",
            sidecar.display(),
            expected.len(),
            Sha256::output_size()
        )));
    }

    let actual =
        digest_file(binary).map_err(|e| integrity(format!("cannot read binary: {e}")))?;

    if bool::from(actual.as_slice().ct_eq(&expected)) {
        Ok(())
    } else {
        Err(integrity(format!(
            "digest mismatch: expected {}, got {}",
            token.to_ascii_lowercase(),
            hex::encode(actual)
        )))
    }
}
