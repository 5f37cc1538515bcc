//! Per-session persistence
//!
//! Append-only store for the action log, screenshot artifacts, and video
//! chunk index, all namespaced under one directory per session. Every JSON
//! record is written with replace-on-write semantics (temp file + rename) so
//! a crash mid-write never leaves a torn file behind.

pub mod bundle;

use crate::action::Action;
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Screenshot capture phase relative to its action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Before,
    During,
    After,
}

impl std::fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapturePhase::Before => write!(f, "before"),
            CapturePhase::During => write!(f, "during"),
            CapturePhase::After => write!(f, "after"),
        }
    }
}

/// A persisted screenshot, immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotArtifact {
    pub screenshot_id: Uuid,
    pub session_id: Uuid,
    pub action_id: Uuid,
    pub phase: CapturePhase,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub wall_clock_captured_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_timestamp_ms: Option<u64>,
    pub capture_latency_ms: u64,
    pub relative_time_ms: u64,
}

impl ScreenshotArtifact {
    /// File name the artifact is stored under, stable across export
    pub fn file_name(&self) -> String {
        format!("{}-{}.{}", self.action_id, self.phase, extension_for(&self.mime_type))
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// An externally produced video segment; the store only indexes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoChunk {
    pub chunk_id: Uuid,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stream_start_ms: u64,
    pub stream_end_ms: u64,
    pub file_path: PathBuf,
}

/// Append-only store for one session's actions, screenshots, and chunks.
pub struct SessionStore {
    session_id: Uuid,
    root: PathBuf,
    screenshots_dir: PathBuf,
    actions: ParkingMutex<Vec<Action>>,
    action_index: ParkingMutex<HashMap<Uuid, usize>>,
    artifacts: ParkingMutex<Vec<ScreenshotArtifact>>,
    chunks: ParkingMutex<Vec<VideoChunk>>,
    output_files: ParkingMutex<Vec<PathBuf>>,
}

impl SessionStore {
    /// Create the per-session directory layout under `base_dir`.
    pub fn create(base_dir: &Path, session_id: Uuid) -> StoreResult<Self> {
        let root = base_dir.join(session_id.to_string());
        let screenshots_dir = root.join("screenshots");
        std::fs::create_dir_all(&screenshots_dir)?;

        Ok(Self {
            session_id,
            root,
            screenshots_dir,
            actions: ParkingMutex::new(Vec::new()),
            action_index: ParkingMutex::new(HashMap::new()),
            artifacts: ParkingMutex::new(Vec::new()),
            chunks: ParkingMutex::new(Vec::new()),
            output_files: ParkingMutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record an action in emission order.
    pub fn append_action(&self, action: Action) {
        let mut actions = self.actions.lock();
        self.action_index.lock().insert(action.action_id, actions.len());
        actions.push(action);
    }

    /// Persist a screenshot and enrich its action in place.
    ///
    /// The artifact's pixel data is written atomically under the session's
    /// screenshot directory; the owning action gets the matching reference
    /// for the phase, and its stream timestamp if it doesn't have one yet.
    /// Returns the artifact's file reference.
    pub fn attach_screenshot(
        &self,
        artifact: ScreenshotArtifact,
        data: &[u8],
        stream_timestamp_ms: Option<u64>,
    ) -> StoreResult<String> {
        let file_name = artifact.file_name();
        let path = self.screenshots_dir.join(&file_name);
        write_bytes_atomic(&path, data)?;

        {
            let slot = self
                .action_index
                .lock()
                .get(&artifact.action_id)
                .copied()
                .ok_or(StoreError::UnknownAction(artifact.action_id))?;
            let mut actions = self.actions.lock();
            let action = &mut actions[slot];
            match artifact.phase {
                CapturePhase::Before => action.before_screenshot_ref = Some(file_name.clone()),
                CapturePhase::During => action.screenshot_ref = Some(file_name.clone()),
                CapturePhase::After => action.after_screenshot_ref = Some(file_name.clone()),
            }
            if action.stream_timestamp_ms.is_none() {
                action.stream_timestamp_ms = stream_timestamp_ms;
            }
        }

        self.artifacts.lock().push(artifact);
        self.output_files.lock().push(path);
        Ok(file_name)
    }

    /// Index a video chunk produced by the recording collaborator.
    pub fn add_chunk(&self, chunk: VideoChunk) {
        self.chunks.lock().push(chunk);
    }

    /// Snapshot of the ordered action log
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().clone()
    }

    pub fn artifacts(&self) -> Vec<ScreenshotArtifact> {
        self.artifacts.lock().clone()
    }

    pub fn chunks(&self) -> Vec<VideoChunk> {
        self.chunks.lock().clone()
    }

    /// Write the action log, artifact index, and chunk index to disk.
    pub fn flush(&self) -> StoreResult<()> {
        let actions_path = self.root.join("actions.json");
        let artifacts_path = self.root.join("screenshots.json");
        let chunks_path = self.root.join("chunks.json");

        write_json_atomic(&actions_path, &*self.actions.lock())?;
        write_json_atomic(&artifacts_path, &*self.artifacts.lock())?;
        write_json_atomic(&chunks_path, &*self.chunks.lock())?;

        let mut output_files = self.output_files.lock();
        for path in [&actions_path, &artifacts_path, &chunks_path] {
            if !output_files.contains(path) {
                output_files.push(path.clone());
            }
        }

        tracing::info!(
            "Session store flushed (session={}, actions={}, screenshots={}, chunks={})",
            self.session_id,
            self.actions.lock().len(),
            self.artifacts.lock().len(),
            self.chunks.lock().len()
        );
        Ok(())
    }

    /// Files written by this store so far
    pub fn output_files(&self) -> Vec<PathBuf> {
        self.output_files.lock().clone()
    }

    /// Read a persisted action log back. A malformed log surfaces as
    /// `Corrupted` so the session can be flagged, never silently discarded.
    pub fn read_action_log(path: &Path) -> StoreResult<Vec<Action>> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| StoreError::Corrupted {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }
}

/// Serialize `value` to `path` via a temp file in the same directory, so the
/// destination is either the old content or the complete new content.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &data)
}

pub fn write_bytes_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    use std::io::Write;

    let dir = path.parent().ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "path has no parent directory",
        ))
    })?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}
