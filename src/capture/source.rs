//! Frame source seam
//!
//! The capture primitive is implemented by the recording collaborator (it
//! owns the live video element and the offscreen encode surface); the
//! coordinator only drives it through this trait.

use crate::error::CaptureResult;
use crate::store::CapturePhase;
use async_trait::async_trait;
use uuid::Uuid;

/// One screenshot request tied to an action and phase
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    pub action_id: Uuid,
    pub phase: CapturePhase,
}

/// An encoded frame grabbed from the live video source
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    /// Wall-clock unix milliseconds at capture time
    pub wall_clock_captured_at: u64,
    /// Position in the recorded media timeline at capture time, when the
    /// source can report it
    pub stream_timestamp_ms: Option<u64>,
    pub capture_latency_ms: u64,
}

/// Live video source the coordinator grabs frames from.
///
/// `capture` must only be called once the source is warm, i.e. it has
/// produced at least one decodable frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn is_warm(&self) -> bool;

    /// Current live playback position, used as a fallback when a captured
    /// image carries no stream timestamp
    fn playback_position_ms(&self) -> Option<u64> {
        None
    }

    async fn capture(&self, request: CaptureRequest) -> CaptureResult<CapturedImage>;
}
