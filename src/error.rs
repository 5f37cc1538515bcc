//! Error types shared across the recording pipeline.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised on the capture side of the pipeline (normalizer, capture
/// coordinator, session lifecycle).
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Frame source has not produced a decodable frame yet")]
    SourceNotWarm,

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for capture-side operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors raised while transferring a session bundle to remote storage.
///
/// The split decides retry policy: `Retryable` failures re-enter the queue
/// with exponential backoff, `Permanent` failures poison the session
/// immediately.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Retryable transfer failure: {0}")]
    Retryable(String),

    #[error("Permanent transfer failure: {0}")]
    Permanent(String),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Retryable(_))
    }
}

/// Errors raised by persistent state (action log, upload state, bundles).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("State corruption in {path}: {detail}")]
    Corrupted { path: PathBuf, detail: String },

    #[error("Unknown action: {0}")]
    UnknownAction(Uuid),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
