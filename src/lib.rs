//! screentrace - screen recording core.
//!
//! Correlates a recorded screen with the input gestures that happened on it:
//! raw pointer/keyboard events are normalized into semantic actions, each
//! action gets before/during/after screenshots grabbed from the live video
//! source, and finished sessions are exported as bundles a durable queue
//! uploads to remote storage.
//!
//! The pipeline is one-directional:
//! event source → [`normalizer`] → [`capture`] → [`store`] → [`upload`].

pub mod action;
pub mod capture;
pub(crate) mod clock;
pub mod error;
pub mod normalizer;
pub mod session;
pub mod store;
pub mod upload;

pub use action::{Action, ActionType, Coords, Modifiers, MouseButton, RawInputEvent};
pub use capture::{CaptureConfig, CaptureCoordinator, CapturedImage, FrameSource};
pub use error::{CaptureError, StoreError, TransferError};
pub use normalizer::{Normalizer, NormalizerConfig};
pub use session::{PermissionProbe, RecordingSession, Session, SessionState, SourceInfo};
pub use store::{CapturePhase, ScreenshotArtifact, SessionStore, VideoChunk};
pub use upload::{UploadBackend, UploadConfig, UploadQueue, UploadState, UploadStatus};

/// Logging setup for binaries embedding the crate
pub mod logging {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    /// Initialize tracing with an env-filter. Safe to call more than once;
    /// later calls are ignored.
    pub fn init() {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "screentrace=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}
