//! Artifact capture coordinator
//!
//! Consumes the ordered action stream and grabs the screenshot phases each
//! action calls for. Jobs run on a single consumer task and each job is
//! awaited to completion, persistence write included, before the next one
//! starts: the frame source is a single shared resource and two concurrent
//! grabs would tear frames. A failed capture is logged and skipped; the
//! action just keeps its references absent.

pub mod source;

pub use source::{CaptureRequest, CapturedImage, FrameSource};

use crate::action::{Action, ActionType};
use crate::error::{CaptureError, CaptureResult};
use crate::store::{CapturePhase, ScreenshotArtifact, SessionStore};
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capture policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Delay before the "after" capture of a discrete action
    pub settle_delay_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { settle_delay_ms: 120 }
    }
}

/// Screenshot phases an action receives: boundary actions get a single
/// "during" frame, discrete actions a before/after pair, committed input
/// values nothing.
fn phases_for(kind: ActionType) -> &'static [CapturePhase] {
    if kind.is_boundary() {
        return &[CapturePhase::During];
    }
    match kind {
        ActionType::Click | ActionType::Keypress => &[CapturePhase::Before, CapturePhase::After],
        _ => &[],
    }
}

/// Serial capture pipeline for one session.
pub struct CaptureCoordinator {
    task: ParkingMutex<Option<JoinHandle<()>>>,
}

impl CaptureCoordinator {
    /// Start the consumer task. It drains until the action sender side is
    /// dropped, then exits.
    pub fn spawn(
        actions: mpsc::UnboundedReceiver<Action>,
        source: Arc<dyn FrameSource>,
        store: Arc<SessionStore>,
        config: CaptureConfig,
    ) -> Self {
        let task = tokio::spawn(run(actions, source, store, config));
        Self {
            task: ParkingMutex::new(Some(task)),
        }
    }

    /// Wait for every queued capture job to settle. Call after the action
    /// sender has been dropped.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(
    mut actions: mpsc::UnboundedReceiver<Action>,
    source: Arc<dyn FrameSource>,
    store: Arc<SessionStore>,
    config: CaptureConfig,
) {
    while let Some(action) = actions.recv().await {
        store.append_action(action.clone());

        for &phase in phases_for(action.kind) {
            let relative_time_ms = match phase {
                CapturePhase::After => {
                    tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;
                    action.relative_time_ms + config.settle_delay_ms
                }
                _ => action.relative_time_ms,
            };
            if let Err(e) = capture_one(&*source, &store, &action, phase, relative_time_ms).await {
                tracing::warn!(
                    "Capture failed (action={}, phase={}): {}",
                    action.action_id,
                    phase,
                    e
                );
            }
        }
    }
    tracing::debug!("Capture coordinator drained (session={})", store.session_id());
}

async fn capture_one(
    source: &dyn FrameSource,
    store: &SessionStore,
    action: &Action,
    phase: CapturePhase,
    relative_time_ms: u64,
) -> CaptureResult<()> {
    if !source.is_warm() {
        return Err(CaptureError::SourceNotWarm);
    }

    let image = source
        .capture(CaptureRequest {
            action_id: action.action_id,
            phase,
        })
        .await?;

    let stream_timestamp_ms = image
        .stream_timestamp_ms
        .or_else(|| source.playback_position_ms());

    let artifact = ScreenshotArtifact {
        screenshot_id: Uuid::new_v4(),
        session_id: action.session_id,
        action_id: action.action_id,
        phase,
        mime_type: image.mime_type.clone(),
        width: image.width,
        height: image.height,
        wall_clock_captured_at: image.wall_clock_captured_at,
        stream_timestamp_ms,
        capture_latency_ms: image.capture_latency_ms,
        relative_time_ms,
    };

    store.attach_screenshot(artifact, &image.data, stream_timestamp_ms)?;
    Ok(())
}
