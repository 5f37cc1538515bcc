//! Durable upload queue
//!
//! One queue per process. Transfers run strictly one at a time on a single
//! worker task; everything else (enqueueing, status queries, cancellation,
//! backoff waits) stays non-blocking. Every state transition is persisted
//! before it is observable, so a crash at any point leaves a record the
//! next start can recover from.

pub mod backend;
pub mod state;

pub use backend::{remote_key, ProgressFn, UploadBackend};
pub use state::{UploadState, UploadStateStore, UploadStatus};

use crate::error::{StoreResult, TransferError};
use crate::store::bundle::SessionBundle;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Queue tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
        }
    }
}

/// Delay before retry attempt `attempt` re-enters the queue:
/// `min(base * 2^attempt, cap)`
pub fn backoff_delay_ms(config: &UploadConfig, attempt: u32) -> u64 {
    if attempt >= 63 {
        return config.backoff_cap_ms;
    }
    config
        .backoff_base_ms
        .saturating_mul(1u64 << attempt)
        .min(config.backoff_cap_ms)
}

enum WorkMsg {
    Upload(Uuid),
    Shutdown,
}

struct Inner {
    config: UploadConfig,
    backend: Arc<dyn UploadBackend>,
    store: UploadStateStore,
    states: ParkingMutex<HashMap<Uuid, UploadState>>,
    work_tx: mpsc::UnboundedSender<WorkMsg>,
    active: ParkingMutex<Option<(Uuid, CancellationToken)>>,
    cancelled: ParkingMutex<HashSet<Uuid>>,
}

impl Inner {
    fn persist(&self, state: &UploadState) -> StoreResult<()> {
        self.store.save(state)?;
        self.states.lock().insert(state.session_id, state.clone());
        Ok(())
    }
}

/// Serial, crash-recoverable transfer queue for exported session bundles.
pub struct UploadQueue {
    inner: Arc<Inner>,
    worker: ParkingMutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Open the persisted state directory and start the worker task. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: UploadConfig,
        backend: Arc<dyn UploadBackend>,
        state_dir: &Path,
    ) -> StoreResult<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            backend,
            store: UploadStateStore::open(state_dir)?,
            states: ParkingMutex::new(HashMap::new()),
            work_tx,
            active: ParkingMutex::new(None),
            cancelled: ParkingMutex::new(HashSet::new()),
        });
        let worker = tokio::spawn(worker_loop(inner.clone(), work_rx));
        Ok(Self {
            inner,
            worker: ParkingMutex::new(Some(worker)),
        })
    }

    /// Scan persisted records from a previous run and re-enqueue whatever
    /// was in flight or waiting. A transfer interrupted mid-flight restarts
    /// from scratch, never from stale progress. Returns the paths of
    /// corrupt records, flagged for manual inspection.
    pub fn recover(&self) -> StoreResult<Vec<PathBuf>> {
        let (states, corrupted) = self.inner.store.load_all()?;
        for mut state in states {
            match state.status {
                UploadStatus::Uploading => {
                    tracing::warn!(
                        "Session {} was interrupted mid-upload; re-enqueueing",
                        state.session_id
                    );
                    state.status = UploadStatus::Pending;
                    state.bytes_uploaded = 0;
                    state.touch();
                    self.inner.persist(&state)?;
                    let _ = self.inner.work_tx.send(WorkMsg::Upload(state.session_id));
                }
                UploadStatus::Pending => {
                    let session_id = state.session_id;
                    self.inner.states.lock().insert(session_id, state);
                    let _ = self.inner.work_tx.send(WorkMsg::Upload(session_id));
                }
                UploadStatus::Failed if !state.permanently_failed() => {
                    state.status = UploadStatus::Pending;
                    state.touch();
                    self.inner.persist(&state)?;
                    let _ = self.inner.work_tx.send(WorkMsg::Upload(state.session_id));
                }
                // Done and poison-pilled sessions stay as they are
                _ => {
                    self.inner.states.lock().insert(state.session_id, state);
                }
            }
        }
        Ok(corrupted)
    }

    /// Queue an exported bundle for transfer. Legal from `not_uploaded` (or
    /// for a session the queue has never seen); anything already queued,
    /// transferring, or finished is left alone, and a failed session needs
    /// an explicit `retry`.
    pub fn enqueue(&self, bundle: &SessionBundle) -> StoreResult<()> {
        let mut states = self.inner.states.lock();
        let state = states.entry(bundle.session_id).or_insert_with(|| {
            UploadState::new(
                bundle.session_id,
                bundle.path.clone(),
                bundle.total_bytes,
                self.inner.config.max_retries,
            )
        });
        match state.status {
            UploadStatus::NotUploaded => {
                state.status = UploadStatus::Pending;
                state.touch();
                let snapshot = state.clone();
                drop(states);
                self.inner.store.save(&snapshot)?;
                let _ = self.inner.work_tx.send(WorkMsg::Upload(bundle.session_id));
                tracing::info!("Enqueued session {} for upload", bundle.session_id);
            }
            UploadStatus::Failed => {
                tracing::warn!(
                    "Session {} is poison-pilled; use retry to re-enqueue",
                    bundle.session_id
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Explicit user retry of a poison-pilled session: reset the retry
    /// budget and re-enqueue. Returns false when the session is not failed.
    pub fn retry(&self, session_id: Uuid) -> StoreResult<bool> {
        let snapshot = {
            let mut states = self.inner.states.lock();
            let Some(state) = states.get_mut(&session_id) else {
                return Ok(false);
            };
            if state.status != UploadStatus::Failed {
                return Ok(false);
            }
            state.status = UploadStatus::Pending;
            state.retry_count = 0;
            state.last_error = None;
            state.touch();
            state.clone()
        };
        self.inner.store.save(&snapshot)?;
        let _ = self.inner.work_tx.send(WorkMsg::Upload(session_id));
        Ok(true)
    }

    /// Cancel a session's transfer. An in-flight transfer is aborted
    /// cooperatively and its partial progress discarded; a queued one is
    /// removed from the queue. Either way the session returns to
    /// `not_uploaded` and needs an explicit re-enqueue.
    pub fn cancel(&self, session_id: Uuid) -> StoreResult<()> {
        if let Some((active_id, token)) = self.inner.active.lock().clone() {
            if active_id == session_id {
                token.cancel();
                return Ok(());
            }
        }
        let snapshot = {
            let mut states = self.inner.states.lock();
            let Some(state) = states.get_mut(&session_id) else {
                return Ok(());
            };
            if state.status != UploadStatus::Pending {
                return Ok(());
            }
            self.inner.cancelled.lock().insert(session_id);
            state.status = UploadStatus::NotUploaded;
            state.touch();
            state.clone()
        };
        self.inner.store.save(&snapshot)
    }

    pub fn status(&self, session_id: Uuid) -> Option<UploadState> {
        self.inner.states.lock().get(&session_id).cloned()
    }

    pub fn statuses(&self) -> Vec<UploadState> {
        let mut all: Vec<UploadState> = self.inner.states.lock().values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Abort any active transfer and stop the worker.
    pub async fn shutdown(&self) {
        if let Some((_, token)) = self.inner.active.lock().clone() {
            token.cancel();
        }
        let _ = self.inner.work_tx.send(WorkMsg::Shutdown);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, mut work_rx: mpsc::UnboundedReceiver<WorkMsg>) {
    while let Some(msg) = work_rx.recv().await {
        let session_id = match msg {
            WorkMsg::Upload(id) => id,
            WorkMsg::Shutdown => break,
        };
        if inner.cancelled.lock().remove(&session_id) {
            continue;
        }
        let Some(mut state) = inner.states.lock().get(&session_id).cloned() else {
            continue;
        };
        if state.status != UploadStatus::Pending {
            continue;
        }

        // The abort token must be registered before the state is observable
        // as uploading, so a cancel that races the pickup still lands.
        let token = CancellationToken::new();
        *inner.active.lock() = Some((session_id, token.clone()));

        state.status = UploadStatus::Uploading;
        state.bytes_uploaded = 0;
        state.touch();
        if let Err(e) = inner.persist(&state) {
            tracing::error!("Failed to persist upload state for {}: {}", session_id, e);
            *inner.active.lock() = None;
            continue;
        }

        let progress_inner = inner.clone();
        let progress: ProgressFn = Box::new(move |sent, total| {
            if let Some(st) = progress_inner.states.lock().get_mut(&session_id) {
                st.bytes_uploaded = sent;
                if total > 0 {
                    st.total_bytes = total;
                }
                st.touch();
            }
        });

        tracing::info!("Uploading session {} ({} bytes)", session_id, state.total_bytes);
        let result = inner
            .backend
            .put(&remote_key(session_id), &state.bundle_path, progress, token.clone())
            .await;
        *inner.active.lock() = None;

        match result {
            Ok(bytes) => {
                state.status = UploadStatus::Done;
                state.bytes_uploaded = bytes;
                state.total_bytes = bytes;
                state.last_error = None;
                state.touch();
                record(&inner, &state);
                tracing::info!("Upload done for session {}", session_id);
            }
            Err(_) if token.is_cancelled() => {
                // A user abort, not a transient failure: partial progress is
                // discarded and the session needs an explicit re-enqueue.
                state.status = UploadStatus::NotUploaded;
                state.bytes_uploaded = 0;
                state.last_error = None;
                state.touch();
                record(&inner, &state);
                tracing::info!("Upload cancelled for session {}", session_id);
            }
            Err(TransferError::Permanent(reason)) => {
                // Poison immediately; the retry budget is marked spent so a
                // restart scan doesn't quietly resurrect the session.
                state.status = UploadStatus::Failed;
                state.retry_count = state.max_retries;
                state.last_error = Some(reason.clone());
                state.touch();
                record(&inner, &state);
                tracing::error!("Permanent upload failure for session {}: {}", session_id, reason);
            }
            Err(TransferError::Retryable(reason)) => {
                let attempt = state.retry_count;
                state.retry_count += 1;
                state.bytes_uploaded = 0;
                state.last_error = Some(reason.clone());
                state.touch();
                if state.retry_count >= state.max_retries {
                    state.status = UploadStatus::Failed;
                    record(&inner, &state);
                    tracing::error!(
                        "Upload failed permanently for session {} after {} attempts: {}",
                        session_id,
                        state.retry_count,
                        reason
                    );
                } else {
                    state.status = UploadStatus::Pending;
                    record(&inner, &state);
                    let delay = backoff_delay_ms(&inner.config, attempt);
                    tracing::warn!(
                        "Upload attempt {} for session {} failed ({}); retrying in {}ms",
                        attempt + 1,
                        session_id,
                        reason,
                        delay
                    );
                    let tx = inner.work_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let _ = tx.send(WorkMsg::Upload(session_id));
                    });
                }
            }
        }
    }
}

fn record(inner: &Inner, state: &UploadState) {
    if let Err(e) = inner.persist(state) {
        tracing::error!(
            "Failed to persist upload state for {}: {}",
            state.session_id,
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed(u64),
        FailRetryable,
        FailPermanent,
        HangUntilCancelled,
    }

    struct FakeBackend {
        outcomes: ParkingMutex<VecDeque<Outcome>>,
        uploads: ParkingMutex<Vec<String>>,
        active: AtomicU32,
        max_active: AtomicU32,
    }

    impl FakeBackend {
        fn scripted(outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: ParkingMutex::new(outcomes.into()),
                uploads: ParkingMutex::new(Vec::new()),
                active: AtomicU32::new(0),
                max_active: AtomicU32::new(0),
            })
        }

        fn always_ok() -> Arc<Self> {
            Self::scripted(Vec::new())
        }

        fn attempts(&self) -> usize {
            self.uploads.lock().len()
        }
    }

    #[async_trait]
    impl UploadBackend for FakeBackend {
        async fn put(
            &self,
            key: &str,
            _bundle: &Path,
            progress: ProgressFn,
            cancel: CancellationToken,
        ) -> Result<u64, TransferError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            self.uploads.lock().push(key.to_string());

            let outcome = self
                .outcomes
                .lock()
                .pop_front()
                .unwrap_or(Outcome::Succeed(100));
            // A little transfer time so overlap would be observable
            tokio::time::sleep(Duration::from_millis(20)).await;
            progress(50, 100);

            let result = match outcome {
                Outcome::Succeed(bytes) => Ok(bytes),
                Outcome::FailRetryable => {
                    Err(TransferError::Retryable("connection reset".to_string()))
                }
                Outcome::FailPermanent => {
                    Err(TransferError::Permanent("credentials rejected".to_string()))
                }
                Outcome::HangUntilCancelled => {
                    cancel.cancelled().await;
                    Err(TransferError::Retryable("aborted mid-flight".to_string()))
                }
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn bundle(dir: &Path) -> SessionBundle {
        SessionBundle {
            session_id: Uuid::new_v4(),
            path: dir.to_path_buf(),
            total_bytes: 100,
        }
    }

    fn queue_with(
        backend: Arc<FakeBackend>,
        config: UploadConfig,
    ) -> (tempfile::TempDir, UploadQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = UploadQueue::new(config, backend, &dir.path().join("upload-state")).unwrap();
        (dir, queue)
    }

    async fn wait_for_status(queue: &UploadQueue, session_id: Uuid, status: UploadStatus) {
        for _ in 0..5_000 {
            if queue.status(session_id).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {:?}, last = {:?}",
            status,
            queue.status(session_id).map(|s| s.status)
        );
    }

    #[test]
    fn test_backoff_delay_formula() {
        let config = UploadConfig::default();
        assert_eq!(backoff_delay_ms(&config, 0), 1_000);
        assert_eq!(backoff_delay_ms(&config, 1), 2_000);
        assert_eq!(backoff_delay_ms(&config, 4), 16_000);
        assert_eq!(backoff_delay_ms(&config, 8), 256_000);
        // Capped at five minutes
        assert_eq!(backoff_delay_ms(&config, 9), 300_000);
        assert_eq!(backoff_delay_ms(&config, 40), 300_000);
        assert_eq!(backoff_delay_ms(&config, 200), 300_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_upload_marks_done() {
        let backend = FakeBackend::always_ok();
        let (_dir, queue) = queue_with(backend.clone(), UploadConfig::default());
        let b = bundle(_dir.path());

        queue.enqueue(&b).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::Done).await;

        let state = queue.status(b.session_id).unwrap();
        assert_eq!(state.bytes_uploaded, state.total_bytes);
        assert_eq!(backend.attempts(), 1);
        assert_eq!(backend.uploads.lock()[0], remote_key(b.session_id));
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_back_off_then_poison() {
        let backend = FakeBackend::scripted(vec![
            Outcome::FailRetryable,
            Outcome::FailRetryable,
            Outcome::FailRetryable,
        ]);
        let config = UploadConfig {
            max_retries: 3,
            ..UploadConfig::default()
        };
        let (_dir, queue) = queue_with(backend.clone(), config);
        let b = bundle(_dir.path());

        queue.enqueue(&b).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::Failed).await;

        let state = queue.status(b.session_id).unwrap();
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.max_retries, 3);
        assert!(state.permanently_failed());
        assert_eq!(state.last_error.as_deref(), Some("connection reset"));
        assert_eq!(backend.attempts(), 3);

        // Poison-pilled: no further automatic attempts arrive
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.attempts(), 3);

        // An explicit user retry resets the budget and re-enqueues
        assert!(queue.retry(b.session_id).unwrap());
        wait_for_status(&queue, b.session_id, UploadStatus::Done).await;
        assert_eq!(queue.status(b.session_id).unwrap().retry_count, 0);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_fails_immediately() {
        let backend = FakeBackend::scripted(vec![Outcome::FailPermanent]);
        let (_dir, queue) = queue_with(backend.clone(), UploadConfig::default());
        let b = bundle(_dir.path());

        queue.enqueue(&b).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::Failed).await;

        let state = queue.status(b.session_id).unwrap();
        assert!(state.permanently_failed());
        assert_eq!(state.last_error.as_deref(), Some("credentials rejected"));
        // No backoff retries were attempted
        assert_eq!(backend.attempts(), 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_returns_to_not_uploaded() {
        let backend = FakeBackend::scripted(vec![Outcome::HangUntilCancelled]);
        let (_dir, queue) = queue_with(backend.clone(), UploadConfig::default());
        let b = bundle(_dir.path());

        queue.enqueue(&b).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::Uploading).await;
        queue.cancel(b.session_id).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::NotUploaded).await;

        // Partial progress discarded; re-enqueue is explicit and works
        let state = queue.status(b.session_id).unwrap();
        assert_eq!(state.bytes_uploaded, 0);
        queue.enqueue(&b).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::Done).await;
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_session_removes_it() {
        let backend = FakeBackend::scripted(vec![Outcome::HangUntilCancelled]);
        let (_dir, queue) = queue_with(backend.clone(), UploadConfig::default());
        let first = bundle(_dir.path());
        let second = bundle(_dir.path());

        queue.enqueue(&first).unwrap();
        wait_for_status(&queue, first.session_id, UploadStatus::Uploading).await;
        queue.enqueue(&second).unwrap();

        // Second is still queued behind the hung transfer; cancel it there
        queue.cancel(second.session_id).unwrap();
        assert_eq!(
            queue.status(second.session_id).unwrap().status,
            UploadStatus::NotUploaded
        );

        queue.cancel(first.session_id).unwrap();
        wait_for_status(&queue, first.session_id, UploadStatus::NotUploaded).await;
        // The cancelled-when-queued session was never attempted
        assert_eq!(backend.attempts(), 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfers_are_globally_serial() {
        let backend = FakeBackend::always_ok();
        let (_dir, queue) = queue_with(backend.clone(), UploadConfig::default());
        let bundles: Vec<SessionBundle> = (0..4).map(|_| bundle(_dir.path())).collect();

        for b in &bundles {
            queue.enqueue(b).unwrap();
        }
        for b in &bundles {
            wait_for_status(&queue, b.session_id, UploadStatus::Done).await;
        }
        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_reenqueues_interrupted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("upload-state");
        let store = UploadStateStore::open(&state_dir).unwrap();

        let mk = |status: UploadStatus, retry_count: u32| {
            let mut st = UploadState::new(Uuid::new_v4(), dir.path().to_path_buf(), 100, 10);
            st.status = status;
            st.retry_count = retry_count;
            store.save(&st).unwrap();
            st
        };
        let interrupted = mk(UploadStatus::Uploading, 2);
        let pending = mk(UploadStatus::Pending, 0);
        let failed_retryable = mk(UploadStatus::Failed, 4);
        let poisoned = mk(UploadStatus::Failed, 10);
        let done = mk(UploadStatus::Done, 0);

        let backend = FakeBackend::always_ok();
        let queue =
            UploadQueue::new(UploadConfig::default(), backend.clone(), &state_dir).unwrap();
        let corrupted = queue.recover().unwrap();
        assert!(corrupted.is_empty());

        for st in [&interrupted, &pending, &failed_retryable] {
            wait_for_status(&queue, st.session_id, UploadStatus::Done).await;
        }
        // Interrupted transfers restart from scratch, not stale progress
        assert_eq!(backend.attempts(), 3);

        // Finished and poison-pilled sessions are untouched
        assert_eq!(queue.status(done.session_id).unwrap().status, UploadStatus::Done);
        let poisoned_state = queue.status(poisoned.session_id).unwrap();
        assert_eq!(poisoned_state.status, UploadStatus::Failed);
        assert_eq!(poisoned_state.retry_count, 10);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_flags_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("upload-state");
        std::fs::create_dir_all(&state_dir).unwrap();
        let bad = state_dir.join(format!("{}.json", Uuid::new_v4()));
        std::fs::write(&bad, b"not json at all").unwrap();

        let queue =
            UploadQueue::new(UploadConfig::default(), FakeBackend::always_ok(), &state_dir)
                .unwrap();
        let corrupted = queue.recover().unwrap();
        assert_eq!(corrupted, vec![bad.clone()]);
        assert!(bad.exists());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_queries_do_not_block_on_active_transfer() {
        let backend = FakeBackend::scripted(vec![Outcome::HangUntilCancelled]);
        let (_dir, queue) = queue_with(backend, UploadConfig::default());
        let b = bundle(_dir.path());

        queue.enqueue(&b).unwrap();
        wait_for_status(&queue, b.session_id, UploadStatus::Uploading).await;

        // Book-keeping stays responsive while the transfer hangs
        assert_eq!(queue.statuses().len(), 1);
        let other = bundle(_dir.path());
        queue.enqueue(&other).unwrap();
        assert_eq!(
            queue.status(other.session_id).unwrap().status,
            UploadStatus::Pending
        );

        queue.cancel(b.session_id).unwrap();
        wait_for_status(&queue, other.session_id, UploadStatus::Done).await;
        queue.shutdown().await;
    }
}
