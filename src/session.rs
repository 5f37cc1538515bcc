//! Session lifecycle
//!
//! One `RecordingSession` per recording: it owns the session store, the
//! normalizer, and the capture coordinator, and walks the session state
//! machine (idle → consenting → recording ⇄ paused → stopping → ended).
//! There is no ambient global state; callers hold the session and pass its
//! handles to whoever needs them.

use crate::capture::{CaptureConfig, CaptureCoordinator, FrameSource};
use crate::error::{CaptureError, CaptureResult, StoreResult};
use crate::normalizer::{Normalizer, NormalizerConfig, RawEventSender};
use crate::store::bundle::{export_bundle, SessionBundle};
use crate::store::{SessionStore, VideoChunk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Consenting,
    Recording,
    Paused,
    Stopping,
    Ended,
}

/// Descriptor of the screen source being recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub id: String,
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
}

/// Session metadata record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub source: SourceInfo,
    pub state: SessionState,
}

/// Capture permission checks performed before anything starts.
pub trait PermissionProbe: Send + Sync {
    fn input_capture_allowed(&self) -> bool;
    fn screen_capture_allowed(&self) -> bool;
}

/// Fixed-answer probe, useful for tests and headless environments.
pub struct StaticProbe {
    input: bool,
    screen: bool,
}

impl StaticProbe {
    pub fn allow_all() -> Self {
        Self {
            input: true,
            screen: true,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            input: false,
            screen: false,
        }
    }
}

impl PermissionProbe for StaticProbe {
    fn input_capture_allowed(&self) -> bool {
        self.input
    }

    fn screen_capture_allowed(&self) -> bool {
        self.screen
    }
}

/// Owner of one recording's pipeline: normalizer → coordinator → store.
pub struct RecordingSession {
    session: Session,
    store: Arc<SessionStore>,
    frame_source: Arc<dyn FrameSource>,
    normalizer_config: NormalizerConfig,
    capture_config: CaptureConfig,
    normalizer: Option<Normalizer>,
    coordinator: Option<CaptureCoordinator>,
    started: Option<tokio::time::Instant>,
    recorded_ms: u64,
}

impl RecordingSession {
    pub fn new(
        source: SourceInfo,
        base_dir: &Path,
        frame_source: Arc<dyn FrameSource>,
        normalizer_config: NormalizerConfig,
        capture_config: CaptureConfig,
    ) -> CaptureResult<Self> {
        let session_id = Uuid::new_v4();
        let store = Arc::new(SessionStore::create(base_dir, session_id)?);
        Ok(Self {
            session: Session {
                session_id,
                created_at: Utc::now(),
                ended_at: None,
                source,
                state: SessionState::Idle,
            },
            store,
            frame_source,
            normalizer_config,
            capture_config,
            normalizer: None,
            coordinator: None,
            started: None,
            recorded_ms: 0,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The consent dialog is owned by the UI collaborator; this only moves
    /// the state machine while the dialog is up.
    pub fn begin_consent(&mut self) {
        if self.session.state == SessionState::Idle {
            self.session.state = SessionState::Consenting;
        }
    }

    /// Check permissions, start the pipeline, and hand back the sender the
    /// platform hook pushes raw events into.
    pub fn start(&mut self, probe: &dyn PermissionProbe) -> CaptureResult<RawEventSender> {
        match self.session.state {
            SessionState::Idle | SessionState::Consenting => {}
            SessionState::Recording | SessionState::Paused => {
                return Err(CaptureError::AlreadyRecording)
            }
            SessionState::Stopping | SessionState::Ended => {
                return Err(CaptureError::NotRecording)
            }
        }
        if !probe.screen_capture_allowed() {
            return Err(CaptureError::PermissionDenied(
                "Screen recording permission not granted. Please allow in system settings and try again.".to_string(),
            ));
        }

        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let normalizer = Normalizer::start(
            self.session.session_id,
            self.normalizer_config.clone(),
            probe,
            action_tx,
        )?;
        let coordinator = CaptureCoordinator::spawn(
            action_rx,
            self.frame_source.clone(),
            self.store.clone(),
            self.capture_config.clone(),
        );

        let sender = normalizer.sender();
        self.normalizer = Some(normalizer);
        self.coordinator = Some(coordinator);
        self.started = Some(tokio::time::Instant::now());
        self.session.state = SessionState::Recording;
        tracing::info!("Recording started (session={})", self.session.session_id);
        Ok(sender)
    }

    /// Suspend action emission and capture scheduling; pipeline state stays
    /// warm for resume.
    pub fn pause(&mut self) -> CaptureResult<()> {
        if self.session.state != SessionState::Recording {
            return Err(CaptureError::NotRecording);
        }
        if let Some(normalizer) = &self.normalizer {
            normalizer.pause();
        }
        if let Some(started) = self.started.take() {
            self.recorded_ms += started.elapsed().as_millis() as u64;
        }
        self.session.state = SessionState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> CaptureResult<()> {
        if self.session.state != SessionState::Paused {
            return Err(CaptureError::NotRecording);
        }
        if let Some(normalizer) = &self.normalizer {
            normalizer.resume();
        }
        self.started = Some(tokio::time::Instant::now());
        self.session.state = SessionState::Recording;
        Ok(())
    }

    /// Stop the pipeline: close open gestures, drain every queued capture
    /// job, and flush the store. Stopping an ended session is a no-op.
    pub async fn stop(&mut self) -> CaptureResult<Vec<PathBuf>> {
        match self.session.state {
            SessionState::Recording | SessionState::Paused => {}
            SessionState::Ended => return Ok(self.store.output_files()),
            _ => return Err(CaptureError::NotRecording),
        }
        self.session.state = SessionState::Stopping;
        if let Some(started) = self.started.take() {
            self.recorded_ms += started.elapsed().as_millis() as u64;
        }

        if let Some(normalizer) = self.normalizer.take() {
            normalizer.stop().await;
        }
        // The normalizer's driver dropped the action sender on stop; joining
        // the coordinator waits for the queue to drain completely.
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.join().await;
        }
        self.store.flush()?;

        self.session.state = SessionState::Ended;
        self.session.ended_at = Some(Utc::now());
        tracing::info!(
            "Recording ended (session={}, duration={}ms)",
            self.session.session_id,
            self.recorded_ms
        );
        Ok(self.store.output_files())
    }

    /// Recorded duration, excluding paused spans
    pub fn duration_ms(&self) -> u64 {
        let live = self
            .started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.recorded_ms + live
    }

    /// Index a video chunk the recording collaborator finished writing.
    pub fn add_chunk(&self, chunk: VideoChunk) {
        self.store.add_chunk(chunk);
    }

    /// Snapshot the session into an uploadable bundle directory.
    pub fn export(&self, dest_dir: &Path, max_retries: u32) -> StoreResult<SessionBundle> {
        export_bundle(&self.store, dest_dir, max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionType, MouseButton, RawInputEvent};
    use crate::capture::{CaptureRequest, CapturedImage};
    use crate::clock::now_unix_ms;
    use async_trait::async_trait;
    use std::time::Duration;

    struct WarmSource;

    #[async_trait]
    impl FrameSource for WarmSource {
        fn is_warm(&self) -> bool {
            true
        }

        async fn capture(&self, _request: CaptureRequest) -> CaptureResult<CapturedImage> {
            Ok(CapturedImage {
                data: vec![1, 2, 3],
                mime_type: "image/png".to_string(),
                width: 4,
                height: 4,
                wall_clock_captured_at: now_unix_ms(),
                stream_timestamp_ms: Some(1),
                capture_latency_ms: 0,
            })
        }
    }

    fn session(dir: &Path) -> RecordingSession {
        RecordingSession::new(
            SourceInfo {
                id: "display-1".to_string(),
                label: "Built-in Display".to_string(),
                width: 2560,
                height: 1440,
                scale_factor: 2.0,
            },
            dir,
            Arc::new(WarmSource),
            NormalizerConfig::default(),
            CaptureConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle_records_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        assert_eq!(s.state(), SessionState::Idle);

        s.begin_consent();
        assert_eq!(s.state(), SessionState::Consenting);

        let sender = s.start(&StaticProbe::allow_all()).unwrap();
        assert_eq!(s.state(), SessionState::Recording);

        sender.push(RawInputEvent::button_down(10.0, 10.0, MouseButton::Left));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outputs = s.stop().await.unwrap();
        assert_eq!(s.state(), SessionState::Ended);
        assert!(s.session().ended_at.is_some());
        assert!(!outputs.is_empty());

        let actions = s.store().actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionType::Click);
        // The click got its before/after pair
        assert!(actions[0].before_screenshot_ref.is_some());
        assert!(actions[0].after_screenshot_ref.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_screen_permission() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        let err = s.start(&StaticProbe::deny_all()).unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        s.start(&StaticProbe::allow_all()).unwrap();
        assert!(matches!(
            s.start(&StaticProbe::allow_all()),
            Err(CaptureError::AlreadyRecording)
        ));
        s.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        s.start(&StaticProbe::allow_all()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        s.pause().unwrap();
        assert_eq!(s.state(), SessionState::Paused);
        let at_pause = s.duration_ms();
        assert_eq!(at_pause, 100);

        // Paused time does not count toward the recording
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(s.duration_ms(), at_pause);

        s.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.stop().await.unwrap();
        assert_eq!(s.duration_ms(), 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        s.start(&StaticProbe::allow_all()).unwrap();
        s.stop().await.unwrap();
        let outputs = s.stop().await.unwrap();
        assert!(!outputs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_export_upload_round_trip() {
        use crate::error::TransferError;
        use crate::upload::{ProgressFn, UploadBackend, UploadConfig, UploadQueue, UploadStatus};
        use tokio_util::sync::CancellationToken;

        struct OkBackend;

        #[async_trait]
        impl UploadBackend for OkBackend {
            async fn put(
                &self,
                _key: &str,
                _bundle: &Path,
                progress: ProgressFn,
                _cancel: CancellationToken,
            ) -> Result<u64, TransferError> {
                progress(64, 64);
                Ok(64)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        let sender = s.start(&StaticProbe::allow_all()).unwrap();
        sender.push(RawInputEvent::button_down(10.0, 10.0, MouseButton::Left));
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.stop().await.unwrap();

        let bundle = s.export(&dir.path().join("exports"), 10).unwrap();
        assert!(bundle.path.join("actions.json").exists());
        assert!(bundle.total_bytes > 0);

        let queue = UploadQueue::new(
            UploadConfig::default(),
            Arc::new(OkBackend),
            &dir.path().join("upload-state"),
        )
        .unwrap();
        queue.enqueue(&bundle).unwrap();

        for _ in 0..1_000 {
            if queue.status(s.session_id()).map(|st| st.status) == Some(UploadStatus::Done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            queue.status(s.session_id()).unwrap().status,
            UploadStatus::Done
        );
        queue.shutdown().await;
    }
}
