//! Content fingerprinting: SHA-256 over file bytes.
//!
//! The hash depends only on the bytes, never on name or timestamps, and is
//! the sole key for duplicate grouping. Near-duplicates are not detected.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::FingerprintError;

const READ_BUF_BYTES: usize = 64 * 1024;
const MAX_LINK_DEPTH: usize = 40;

/// Computes the hex SHA-256 of the file at `path`.
pub fn fingerprint(path: &Path) -> Result<String, FingerprintError> {
    check_symlink_loop(path)?;

    let read_err = |source| FingerprintError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let mut reader = BufReader::with_capacity(READ_BUF_BYTES, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUF_BYTES];

    loop {
        let n = reader.read(&mut buffer).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Follows a symlink chain and fails on a cycle or an over-long chain.
fn check_symlink_loop(path: &Path) -> Result<(), FingerprintError> {
    let mut current: PathBuf = path.to_path_buf();
    let mut visited = HashSet::new();

    while current.is_symlink() {
        if !visited.insert(current.clone()) || visited.len() > MAX_LINK_DEPTH {
            return Err(FingerprintError::SymlinkLoop(path.to_path_buf()));
        }
        let target = std::fs::read_link(&current).map_err(|source| FingerprintError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        current = if target.is_absolute() {
            target
        } else {
            current
                .parent()
                .map(|p| p.join(&target))
                .unwrap_or(target)
        };
    }

    Ok(())
}
