//! File checksums for release manifests.
//!
//! Checksums are carried as `"<algo>:<hexdigest>"` so the manifest format can
//! grow new algorithms; SHA-256 is the only one produced or verified today.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_CHUNK: usize = 64 * 1024;

/// Compute the checksum of a file as `"sha256:<hexdigest>"`.
pub fn file_checksum(path: &Path) -> Result<String, ChecksumError> {
    let mut file =
        File::open(path).map_err(|e| ChecksumError::Io(path.display().to_string(), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| ChecksumError::Io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Verify a file against a `"<algo>:<hexdigest>"` string.
///
/// Returns `Ok(true)` on a match, `Ok(false)` on a digest mismatch, and an
/// error for an unreadable file, a malformed checksum string, or an
/// algorithm this build does not implement.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<bool, ChecksumError> {
    let (algo, _digest) = expected
        .split_once(':')
        .ok_or_else(|| ChecksumError::MalformedChecksum(expected.to_string()))?;
    if algo != "sha256" {
        return Err(ChecksumError::UnsupportedAlgorithm(algo.to_string()));
    }
    let actual = file_checksum(path)?;
    Ok(actual == expected)
}

/// Checksum every regular file under `dir`, keyed by slash-separated
/// relative path. Files whose *name* matches one of `exclude` glob patterns
/// are skipped.
pub fn directory_checksums(
    dir: &Path,
    exclude: &[glob::Pattern],
) -> Result<BTreeMap<String, String>, ChecksumError> {
    let mut out = BTreeMap::new();
    walk(dir, dir, exclude, &mut out)?;
    Ok(out)
}

fn walk(
    root: &Path,
    dir: &Path,
    exclude: &[glob::Pattern],
    out: &mut BTreeMap<String, String>,
) -> Result<(), ChecksumError> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| ChecksumError::Io(dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ChecksumError::Io(dir.display().to_string(), e))?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, exclude, out)?;
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if exclude.iter().any(|p| p.matches(&name)) {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .expect("walked path is under root")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.insert(rel, file_checksum(&path)?);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("malformed checksum string: {0:?} (expected \"algo:hexdigest\")")]
    MalformedChecksum(String),
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),
}
