//! Session bundle export
//!
//! A bundle is the unit the upload queue transfers: one directory per
//! session holding the ordered action log, the `{actionId}-{phase}`
//! screenshot files, the indexed video chunk files, and an initial
//! upload-state record.

use crate::error::StoreResult;
use crate::store::{write_json_atomic, SessionStore};
use crate::upload::state::UploadState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const ACTION_LOG_FILE: &str = "actions.json";
pub const ARTIFACT_INDEX_FILE: &str = "screenshots.json";
pub const CHUNK_INDEX_FILE: &str = "chunks.json";
pub const UPLOAD_STATE_FILE: &str = "upload-state.json";

/// An exported, self-contained session directory ready for upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBundle {
    pub session_id: Uuid,
    pub path: PathBuf,
    pub total_bytes: u64,
}

/// Snapshot `store` into `dest_dir/{sessionId}`.
///
/// The store is flushed first so the copied indexes match the in-memory
/// state; chunk files are pulled in from wherever the recorder wrote them.
pub fn export_bundle(
    store: &SessionStore,
    dest_dir: &Path,
    max_retries: u32,
) -> StoreResult<SessionBundle> {
    store.flush()?;

    let session_id = store.session_id();
    let bundle_dir = dest_dir.join(session_id.to_string());
    let screenshots_dir = bundle_dir.join("screenshots");
    let chunks_dir = bundle_dir.join("chunks");
    std::fs::create_dir_all(&screenshots_dir)?;
    std::fs::create_dir_all(&chunks_dir)?;

    write_json_atomic(&bundle_dir.join(ACTION_LOG_FILE), &store.actions())?;
    write_json_atomic(&bundle_dir.join(ARTIFACT_INDEX_FILE), &store.artifacts())?;

    for artifact in store.artifacts() {
        let name = artifact.file_name();
        let src = store.root().join("screenshots").join(&name);
        std::fs::copy(&src, screenshots_dir.join(&name))?;
    }

    // Rewrite chunk paths so the index stays valid inside the bundle
    let mut chunks = store.chunks();
    for chunk in &mut chunks {
        let name = chunk
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("{}.bin", chunk.chunk_id).into());
        let dest = chunks_dir.join(&name);
        std::fs::copy(&chunk.file_path, &dest)?;
        chunk.file_path = PathBuf::from("chunks").join(&name);
    }
    write_json_atomic(&bundle_dir.join(CHUNK_INDEX_FILE), &chunks)?;

    let total_bytes = dir_size(&bundle_dir)?;
    let upload_state = UploadState::new(session_id, bundle_dir.clone(), total_bytes, max_retries);
    write_json_atomic(&bundle_dir.join(UPLOAD_STATE_FILE), &upload_state)?;

    tracing::info!(
        "Exported session bundle (session={}, bytes={})",
        session_id,
        total_bytes
    );

    Ok(SessionBundle {
        session_id,
        path: bundle_dir,
        total_bytes,
    })
}

fn dir_size(dir: &Path) -> StoreResult<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}
