//! SHA-256 and SHA-512 content verification.
//!
//! Validates the integrity of manifests and blobs read from a transport.

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;

/// Computes the digest of `data` with the algorithm of `like`.
///
/// Unknown algorithms are reported as a configuration error rather than
/// silently trusted.
///
/// # Errors
///
/// Returns `StevedoreError::Config` for algorithms other than `sha256` and
/// `sha512`.
pub fn digest_like(data: &[u8], like: &Digest) -> Result<Digest> {
    match like.algorithm() {
        "sha256" => Ok(Digest::sha256_of(data)),
        "sha512" => Ok(Digest::sha512_of(data)),
        other => Err(StevedoreError::Config {
            message: format!("digest algorithm {other} is not supported for verification"),
        }),
    }
}

/// Validates that `data` matches `expected`.
///
/// # Errors
///
/// Returns `StevedoreError::HashMismatch` if the digests differ.
pub fn validate(resource: &str, data: &[u8], expected: &Digest) -> Result<()> {
    tracing::debug!(resource, expected = %expected, "validating digest");
    let actual = digest_like(data, expected)?;
    if &actual != expected {
        return Err(StevedoreError::HashMismatch {
            resource: resource.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
