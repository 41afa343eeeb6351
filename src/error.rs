//! Error types for SLO uploads
//!
//! Separates session-level failures (configuration, credentials, log
//! corruption) that abort a run from segment-level failures that only
//! leave a segment unlogged for the next run.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for all upload operations
#[derive(Debug, Error)]
pub enum SloError {
    // ========== Configuration Errors ==========

    /// Invalid or incompatible configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Source file cannot be inspected
    #[error("Cannot read source file {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ========== Auth Errors ==========

    /// Neither explicit credentials nor the OS_* environment are usable
    #[error("Missing credentials: pass --storage-url and --auth-token or set {missing}")]
    MissingCredentials { missing: String },

    /// Storage rejected the credentials or the auth service failed
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Target container does not exist
    #[error("Container does not exist: {container}")]
    ContainerNotFound { container: String },

    // ========== Segment Errors ==========

    /// Local read/write failure while materializing or purging a segment
    #[error("Segment {sequence} I/O failed: {source}")]
    SegmentIo {
        sequence: u32,
        #[source]
        source: std::io::Error,
    },

    /// Storage request failed
    #[error("Storage operation failed: {message}")]
    StorageError { message: String },

    /// Storage reported a different digest than the bytes we sent
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // ========== Recovery Log Errors ==========

    /// Unparseable recovery record
    #[error("Recovery log corrupted at line {line}: {content:?}")]
    LogCorruption { line: usize, content: String },

    /// Recovery log could not be read or appended
    #[error("Recovery log {} I/O failed: {source}", path.display())]
    RecoveryLogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Existing recovery log belongs to another file or segment size
    #[error("Recovery log does not match the current upload: {reason}")]
    SessionMismatch { reason: String },

    // ========== Manifest Errors ==========

    /// Manifest cannot be assembled from the log
    #[error("Manifest validation failed: {reason}")]
    ManifestInvalid { reason: String },

    /// Manifest upload failed after all attempts
    #[error("Manifest commit failed after {attempts} attempts: {message}")]
    CommitFailed { attempts: u32, message: String },

    /// Some segments did not reach the recovery log
    #[error("{} of {total} segments failed to upload: {failed:?}", failed.len())]
    IncompleteUpload { failed: Vec<u32>, total: u32 },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SloError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SloError::StorageError { .. } | SloError::ChecksumMismatch { .. }
        )
    }

    /// Returns true if the failure left durable progress that a re-run resumes
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SloError::IncompleteUpload { .. } | SloError::CommitFailed { .. }
        )
    }

    /// Returns true if this error indicates a damaged recovery log
    pub fn is_corruption(&self) -> bool {
        matches!(self, SloError::LogCorruption { .. })
    }
}

/// Result type alias for upload operations
pub type Result<T> = std::result::Result<T, SloError>;
