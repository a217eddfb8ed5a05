//! SHA-256 verification of downloaded client binaries.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::TunnelError;

const READ_CHUNK: usize = 64 * 1024;

/// Expected SHA-256 digests keyed by download URL.
///
/// An empty registry is valid: URLs without an entry are not verified.
#[derive(Debug, Clone, Default)]
pub struct ChecksumRegistry {
    entries: HashMap<String, String>,
}

impl ChecksumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sha256_hex` for `url`, builder style.
    #[must_use]
    pub fn with(mut self, url: impl Into<String>, sha256_hex: impl Into<String>) -> Self {
        self.insert(url, sha256_hex);
        self
    }

    pub fn insert(&mut self, url: impl Into<String>, sha256_hex: impl Into<String>) {
        self.entries
            .insert(url.into(), sha256_hex.into().trim().to_ascii_lowercase());
    }

    /// Expected digest for `url`, lower-case hex.
    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries.get(url).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<U, H> FromIterator<(U, H)> for ChecksumRegistry
where
    U: Into<String>,
    H: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (U, H)>>(iter: I) -> Self {
        let mut registry = Self::new();
        for (url, sha256_hex) in iter {
            registry.insert(url, sha256_hex);
        }
        registry
    }
}

/// Streaming SHA-256 of a file, lower-case hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare the file's digest against `expected` (case-insensitive hex).
pub fn verify_file(path: &Path, expected: &str, url: &str) -> Result<(), TunnelError> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        tracing::debug!(path = %path.display(), "Binary checksum verified");
        Ok(())
    } else {
        Err(TunnelError::ChecksumMismatch {
            path: path.to_path_buf(),
            url: url.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
