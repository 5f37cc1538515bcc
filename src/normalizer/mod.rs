//! Action normalizer
//!
//! Turns the raw platform event stream into ordered semantic `Action`s.
//! Raw events may be pushed from any thread; a single driver task serializes
//! them into the `NormalizerState` machine, so gesture state never sees
//! concurrent writers. Debounce timers are spawned sleeps whose handle is
//! stored and aborted on reschedule; a generation counter makes late firings
//! harmless.

pub mod state;

pub use state::{NormalizerConfig, NormalizerState};

use crate::action::{Action, RawInputEvent};
use crate::clock::now_unix_ms;
use crate::error::{CaptureError, CaptureResult};
use crate::session::PermissionProbe;
use parking_lot::Mutex as ParkingMutex;
use state::{EventTime, TimerKind, TimerRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

enum Msg {
    Raw(RawInputEvent),
    Timer(TimerKind, u64),
    Pause,
    Resume,
    Stop(oneshot::Sender<()>),
}

/// Cloneable handle the event source uses to push raw events.
#[derive(Clone, Debug)]
pub struct RawEventSender {
    tx: mpsc::UnboundedSender<Msg>,
}

impl RawEventSender {
    /// Push a raw event into the normalizer. Events pushed after stop are
    /// silently dropped.
    pub fn push(&self, event: RawInputEvent) {
        let _ = self.tx.send(Msg::Raw(event));
    }
}

#[derive(Default)]
struct TimerSlots {
    scroll: Option<JoinHandle<()>>,
    hover: Option<JoinHandle<()>>,
}

impl TimerSlots {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TimerKind::Scroll => &mut self.scroll,
            TimerKind::Hover => &mut self.hover,
        }
    }

    fn cancel_all(&mut self) {
        for slot in [&mut self.scroll, &mut self.hover] {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// One normalizer per active session.
pub struct Normalizer {
    tx: mpsc::UnboundedSender<Msg>,
    running: Arc<AtomicBool>,
    task: ParkingMutex<Option<JoinHandle<()>>>,
}

impl Normalizer {
    /// Acquire the event source and start the driver task. Fails with
    /// `PermissionDenied` when input capture is not allowed, in which case no
    /// actions are ever produced.
    pub fn start(
        session_id: Uuid,
        config: NormalizerConfig,
        probe: &dyn PermissionProbe,
        actions: mpsc::UnboundedSender<Action>,
    ) -> CaptureResult<Self> {
        if !probe.input_capture_allowed() {
            return Err(CaptureError::PermissionDenied(
                "Input capture permission not granted. Please allow input monitoring and try again.".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(session_id, config, rx, tx.clone(), actions));

        tracing::info!("Normalizer started (session={})", session_id);

        Ok(Self {
            tx,
            running: Arc::new(AtomicBool::new(true)),
            task: ParkingMutex::new(Some(task)),
        })
    }

    /// Handle for the event source to push raw events through.
    pub fn sender(&self) -> RawEventSender {
        RawEventSender { tx: self.tx.clone() }
    }

    /// Suspend action emission. Open scroll/hover sessions are closed first
    /// so the action stream stays balanced; raw events arriving while paused
    /// are discarded.
    pub fn pause(&self) {
        let _ = self.tx.send(Msg::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(Msg::Resume);
    }

    /// Stop the driver, force-closing any open gesture so every `_start` has
    /// a matching `_end`. Stopping an already-stopped normalizer is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("Normalizer stopped");
    }
}

async fn drive(
    session_id: Uuid,
    config: NormalizerConfig,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    tx: mpsc::UnboundedSender<Msg>,
    actions: mpsc::UnboundedSender<Action>,
) {
    let started = tokio::time::Instant::now();
    let mut machine = NormalizerState::new(session_id, config);
    let mut timers = TimerSlots::default();
    let mut paused = false;

    while let Some(msg) = rx.recv().await {
        let t = EventTime {
            wall_ms: now_unix_ms(),
            rel_ms: started.elapsed().as_millis() as u64,
        };
        match msg {
            Msg::Raw(event) => {
                if paused {
                    continue;
                }
                let out = machine.on_event(&event, t);
                emit(&actions, out.actions);
                for request in out.timers {
                    schedule(&mut timers, &tx, request);
                }
            }
            Msg::Timer(kind, generation) => {
                emit(&actions, machine.on_timer(kind, generation));
            }
            Msg::Pause => {
                if !paused {
                    paused = true;
                    timers.cancel_all();
                    emit(&actions, machine.force_close(t));
                    tracing::debug!("Normalizer paused (session={})", session_id);
                }
            }
            Msg::Resume => {
                paused = false;
                tracing::debug!("Normalizer resumed (session={})", session_id);
            }
            Msg::Stop(ack) => {
                timers.cancel_all();
                emit(&actions, machine.force_close(t));
                let _ = ack.send(());
                break;
            }
        }
    }
}

fn emit(actions: &mpsc::UnboundedSender<Action>, batch: Vec<Action>) {
    for action in batch {
        if actions.send(action).is_err() {
            tracing::warn!("Action receiver dropped; discarding action");
        }
    }
}

fn schedule(timers: &mut TimerSlots, tx: &mpsc::UnboundedSender<Msg>, request: TimerRequest) {
    let slot = timers.slot(request.kind);
    if let Some(previous) = slot.take() {
        previous.abort();
    }
    let tx = tx.clone();
    *slot = Some(tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
        let _ = tx.send(Msg::Timer(request.kind, request.generation));
    }));
}
