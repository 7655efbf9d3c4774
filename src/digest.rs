//! SHA256 digest utilities for registry blobs
//!
//! This module provides centralized functionality for computing, validating,
//! and formatting the content digests that address manifests and blobs.

use crate::error::{RegistryError, Result};
use sha2::{Digest, Sha256};

pub const SHA256_PREFIX: &str = "sha256:";

/// Utilities for working with SHA256 digests in registry context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("{}{}", SHA256_PREFIX, Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate full digest format (sha256:xxxxx)
    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix(SHA256_PREFIX)
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Split `algorithm:encoded`
    pub fn split(digest: &str) -> Option<(&str, &str)> {
        let (algorithm, encoded) = digest.split_once(':')?;
        if algorithm.is_empty() || encoded.is_empty() {
            return None;
        }
        Some((algorithm, encoded))
    }

    /// Reject digests this tool cannot verify before any bytes are fetched
    pub fn ensure_verifiable(digest: &str) -> Result<()> {
        match Self::split(digest) {
            Some(("sha256", encoded)) if Self::is_valid_sha256_hex(encoded) => Ok(()),
            Some(("sha256", _)) => Err(RegistryError::Integrity {
                digest: digest.to_string(),
                reason: "malformed sha256 hex".to_string(),
            }),
            Some((algorithm, _)) => Err(RegistryError::Integrity {
                digest: digest.to_string(),
                reason: format!("unsupported digest algorithm {}", algorithm),
            }),
            None => Err(RegistryError::Integrity {
                digest: digest.to_string(),
                reason: "not of the form algorithm:hex".to_string(),
            }),
        }
    }

    /// File name fragment for a digest: `sha256:abc` becomes `sha256_abc`
    pub fn to_file_component(digest: &str) -> String {
        digest.replace(':', "_")
    }

    /// Format digest for display (truncated for readability)
    pub fn format_digest_short(digest: &str) -> String {
        if digest.len() > 23 {
            format!("{}...", &digest[..23])
        } else {
            digest.to_string()
        }
    }

    /// Verify data matches expected digest
    pub fn verify_data_integrity(data: &[u8], expected_digest: &str) -> Result<()> {
        Self::ensure_verifiable(expected_digest)?;
        verify(expected_digest, &Self::compute_docker_digest(data))
    }
}

/// Compare a computed digest against the advertised one
pub fn verify(expected: &str, actual: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(RegistryError::Integrity {
            digest: expected.to_string(),
            reason: format!("computed {}", actual),
        })
    }
}

/// Incremental SHA256 over a streamed body
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish hashing and return the `sha256:<hex>` digest
    pub fn finalize(self) -> String {
        format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.finalize()))
    }
}
