//! Unified error types for the Stevedore workspace.
//!
//! Every crate in the workspace returns [`StevedoreError`]. Transport
//! failures carry a `transient` flag so that callers can decide whether an
//! operation is worth retrying.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StevedoreError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Stored or fetched data could not be decoded.
    #[error("malformed {what}: {message}")]
    MalformedData {
        /// What was being decoded (e.g. "manifest list").
        what: String,
        /// Decoder message.
        message: String,
    },

    /// A manifest was neither a recognized image manifest nor a list.
    #[error("unsupported manifest media type {media_type:?} for {reference}")]
    UnsupportedMediaType {
        /// The media type that was encountered.
        media_type: String,
        /// Reference the manifest was read from.
        reference: String,
    },

    /// An operation was attempted before its prerequisite step.
    #[error("precondition failed: {message}")]
    Precondition {
        /// Description of the missing prerequisite.
        message: String,
    },

    /// Reading a manifest or blob from a transport failed.
    #[error("fetching {reference}: {message}")]
    Fetch {
        /// Reference that was being read.
        reference: String,
        /// Description of the failure.
        message: String,
        /// Whether retrying may succeed.
        transient: bool,
    },

    /// Writing a manifest or blob to a transport failed.
    #[error("pushing to {reference}: {message}")]
    Push {
        /// Reference that was being written.
        reference: String,
        /// Description of the failure.
        message: String,
        /// Whether retrying may succeed.
        transient: bool,
    },

    /// An image reference string could not be parsed.
    #[error("invalid image reference {reference:?}: {message}")]
    InvalidReference {
        /// The offending reference.
        reference: String,
        /// Parser message.
        message: String,
    },

    /// A container network definition is invalid or conflicts.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// The operation was cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected digest.
        expected: String,
        /// Actual computed digest.
        actual: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StevedoreError {
    /// Returns `true` when the failure came from a transport and may go
    /// away if the operation is attempted again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { transient, .. } | Self::Push { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Builds an I/O error for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a malformed-data error.
    pub fn malformed(what: impl Into<String>, message: impl ToString) -> Self {
        Self::MalformedData {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StevedoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_report_transience() {
        let fetch = StevedoreError::Fetch {
            reference: "docker://example.com/a".into(),
            message: "connection refused".into(),
            transient: true,
        };
        let push = StevedoreError::Push {
            reference: "docker://example.com/a".into(),
            message: "unauthorized".into(),
            transient: false,
        };
        assert!(fetch.is_transient());
        assert!(!push.is_transient());
    }

    #[test]
    fn non_transport_errors_are_never_transient() {
        assert!(!StevedoreError::Cancelled.is_transient());
        let err = StevedoreError::Precondition {
            message: "list not yet saved".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "precondition failed: list not yet saved");
    }
}
