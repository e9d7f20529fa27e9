//! Error taxonomy shared by every oneiric crate.
//!
//! `OneiricError` is the umbrella enum consumers match on; each variant wraps
//! a focused sub-error carrying the structured reason code a caller needs to
//! branch on without parsing a message string.

use thiserror::Error;

/// Sub-codes for [`LifecycleError`], matched against by callers that need to
/// distinguish rollback-on-health-failure from a hard timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LifecycleErrorReason {
    FactoryError,
    HealthFailed,
    HookError,
    CleanupError,
    Timeout,
}

impl std::fmt::Display for LifecycleErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FactoryError => "factory_error",
            Self::HealthFailed => "health_failed",
            Self::HookError => "hook_error",
            Self::CleanupError => "cleanup_error",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Raised by the lifecycle manager for any failed `activate`/`swap` call.
#[derive(Debug, Error)]
#[error("Swap failed: {message}")]
pub struct LifecycleError {
    pub reason: LifecycleErrorReason,
    pub message: String,
}

impl LifecycleError {
    pub fn new(reason: LifecycleErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Sub-codes for [`RemoteSyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSyncErrorReason {
    Network,
    Schema,
    Signature,
    Digest,
    Parse,
}

impl std::fmt::Display for RemoteSyncErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Schema => "schema",
            Self::Signature => "signature",
            Self::Digest => "digest",
            Self::Parse => "parse",
        };
        f.write_str(s)
    }
}

/// Raised by the remote manifest pipeline.
#[derive(Debug, Error)]
#[error("remote sync failed ({reason}): {message}")]
pub struct RemoteSyncError {
    pub reason: RemoteSyncErrorReason,
    pub message: String,
}

impl RemoteSyncError {
    pub fn new(reason: RemoteSyncErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Raised when a cache path or artifact URI escapes the configured cache
/// directory.
#[derive(Debug, Error)]
#[error("path traversal rejected: {0}")]
pub struct PathTraversalError(pub String);

/// Raised by the settings loader for malformed configuration.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Umbrella error type returned by every public `oneiric-core` operation.
#[derive(Debug, Error)]
pub enum OneiricError {
    #[error("candidate not found for ({domain}, {key})")]
    CandidateNotFound { domain: String, key: String },

    #[error("factory forbidden: {0}")]
    FactoryForbidden(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    RemoteSync(#[from] RemoteSyncError),

    #[error(transparent)]
    PathTraversal(#[from] PathTraversalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OneiricError>;
