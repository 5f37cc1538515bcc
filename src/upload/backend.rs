//! Upload backend seam
//!
//! The queue talks to remote storage exclusively through this trait: a
//! key-addressable object store that reports progress and observes a
//! cooperative abort signal.

use crate::error::TransferError;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress callback: `(bytes_uploaded, total_bytes)`
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Remote object key for a session, derived deterministically so re-uploads
/// land on the same object
pub fn remote_key(session_id: Uuid) -> String {
    format!("sessions/{}", session_id)
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// Transfer the bundle directory at `bundle` to `key`, returning the
    /// number of bytes written. Implementations must observe `cancel` to
    /// stop mid-flight; a cancelled transfer returns an error and its
    /// partial progress is discarded by the queue.
    async fn put(
        &self,
        key: &str,
        bundle: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<u64, TransferError>;
}
