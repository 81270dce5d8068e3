//! Common error types for OmniStore.

use thiserror::Error;

/// Top-level error type for OmniStore operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration meant for one backend was handed to another.
    #[error("Config mismatch: expecting type \"{expected}\" but found type \"{found}\"")]
    ConfigMismatch { expected: String, found: String },

    /// Invalid input provided (malformed config, empty name, bad range).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Operation requires `init()` to have completed.
    #[error("Storage has not been initialized yet; call init() first")]
    NotInitialized,

    /// File operation attempted without an active bucket.
    #[error("No bucket selected; select a bucket first")]
    NoBucketSelected,

    /// Bucket does not exist on the backend.
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Object does not exist in the bucket.
    #[error("File {key} could not be retrieved from bucket {bucket}")]
    ObjectNotFound { bucket: String, key: String },

    /// Bucket is already owned by the caller.
    ///
    /// Capability providers report this; the backend layer turns it into success.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Reading the source or writing the sink failed mid-transfer.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Opaque vendor or transport fault, original message preserved.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Stable machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigMismatch { .. } => "config_mismatch",
            Error::Validation(_) => "validation",
            Error::NotInitialized => "not_initialized",
            Error::NoBucketSelected => "no_bucket_selected",
            Error::BucketNotFound(_) => "bucket_not_found",
            Error::ObjectNotFound { .. } => "object_not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Transfer(_) => "transfer",
            Error::Backend(_) => "backend",
        }
    }

    /// Shorthand for [`Error::ObjectNotFound`].
    pub fn object_not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Error::ObjectNotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Whether this error is raised before any remote call is attempted.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::ConfigMismatch { .. }
                | Error::Validation(_)
                | Error::NotInitialized
                | Error::NoBucketSelected
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_mismatch_message() {
        let err = Error::ConfigMismatch {
            expected: "b2".to_string(),
            found: "s3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Config mismatch: expecting type \"b2\" but found type \"s3\""
        );
        assert_eq!(err.kind(), "config_mismatch");
    }

    #[test]
    fn test_precondition_classification() {
        assert!(Error::NoBucketSelected.is_precondition());
        assert!(Error::Validation("x".to_string()).is_precondition());
        assert!(!Error::Backend("boom".to_string()).is_precondition());
        assert!(!Error::object_not_found("b", "k").is_precondition());
    }
}
