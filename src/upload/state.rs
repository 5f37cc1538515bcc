//! Persisted per-session upload state
//!
//! One record per session, mutated only by the upload queue and written
//! atomically after every transition so queue observability survives
//! restarts.

use crate::error::{StoreError, StoreResult};
use crate::store::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    NotUploaded,
    Pending,
    Uploading,
    Done,
    Failed,
}

/// Upload bookkeeping for one exported session bundle.
///
/// Invariant: `retry_count <= max_retries`, and `status == Failed` only once
/// `retry_count == max_retries` (permanent failures poison the record by
/// setting both at once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub session_id: Uuid,
    pub status: UploadStatus,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub bundle_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadState {
    pub fn new(
        session_id: Uuid,
        bundle_path: PathBuf,
        total_bytes: u64,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            status: UploadStatus::NotUploaded,
            bytes_uploaded: 0,
            total_bytes,
            retry_count: 0,
            max_retries,
            last_error: None,
            bundle_path,
            created_at: now,
            updated_at: now,
        }
    }

    /// Poison-pilled: automatic retry is exhausted, only an explicit user
    /// retry can revive the session.
    pub fn permanently_failed(&self) -> bool {
        self.status == UploadStatus::Failed && self.retry_count >= self.max_retries
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Directory of `{sessionId}.json` upload-state records.
pub struct UploadStateStore {
    dir: PathBuf,
}

impl UploadStateStore {
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    pub fn save(&self, state: &UploadState) -> StoreResult<()> {
        write_json_atomic(&self.path_for(state.session_id), state)
    }

    pub fn load(&self, session_id: Uuid) -> StoreResult<Option<UploadState>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        let state = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupted {
            path,
            detail: e.to_string(),
        })?;
        Ok(Some(state))
    }

    /// Scan every persisted record. Unreadable records are returned
    /// separately so callers can flag them for manual inspection; they are
    /// never deleted here.
    pub fn load_all(&self) -> StoreResult<(Vec<UploadState>, Vec<PathBuf>)> {
        let mut states = Vec::new();
        let mut corrupted = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path) {
                Ok(data) => match serde_json::from_slice::<UploadState>(&data) {
                    Ok(state) => states.push(state),
                    Err(e) => {
                        tracing::error!(
                            "Corrupt upload state at {} ({}); flagged for manual inspection",
                            path.display(),
                            e
                        );
                        corrupted.push(path);
                    }
                },
                Err(e) => {
                    tracing::error!("Unreadable upload state at {} ({})", path.display(), e);
                    corrupted.push(path);
                }
            }
        }
        states.sort_by_key(|s| s.created_at);
        Ok((states, corrupted))
    }
}
