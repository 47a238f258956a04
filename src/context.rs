//! Shared state for one replay run.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, SystemTime},
};

use tokio::{sync::{mpsc, watch}, time::Instant};

use crate::{
    correlate::CorrelationTable,
    cursor_map::CursorMap,
    error::Error,
    options::ReplayOptions,
    stats::StatSink,
};

/// Handle to a worker. Once all handles have been dropped, the run's
/// shutdown barrier releases.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

/// Listener used to determine when all worker handles have been dropped.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    /// Listen until all handles are dropped.
    /// This will not return until all handles are dropped, so make sure to
    /// only poll this once every handle-holding task can make progress.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }

    /// Constructs a new channel for monitoring whether any workers are
    /// still running.
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _sender: sender },
            WorkerHandleListener { receiver },
        )
    }
}

/// State shared by the dispatcher and every session worker for the
/// duration of one run. Created at run start, torn down after the
/// shutdown barrier releases.
#[derive(Debug)]
pub(crate) struct ExecutionContext {
    pub(crate) correlation: CorrelationTable,
    pub(crate) cursors: CursorMap,
    pub(crate) stats: StatSink,

    /// The wall-clock anchor that recorded offsets are replayed against.
    pub(crate) start_instant: Instant,
    pub(crate) start_wall: SystemTime,

    drain_rx: watch::Receiver<bool>,
    drain_tx: watch::Sender<bool>,

    fatal: Mutex<Option<Error>>,

    pub(crate) ops_played: AtomicU64,
    pub(crate) ops_skipped: AtomicU64,
    pub(crate) source_errors: AtomicU64,
    pub(crate) dropped_packet_errors: AtomicU64,
}

impl ExecutionContext {
    pub(crate) fn new(options: &ReplayOptions, stats: StatSink) -> Self {
        let (drain_tx, drain_rx) = watch::channel(false);
        Self {
            correlation: CorrelationTable::new(options.pair_ttl),
            cursors: CursorMap::new(options.cursor_ttl),
            stats,
            start_instant: Instant::now(),
            start_wall: SystemTime::now(),
            drain_rx,
            drain_tx,
            fatal: Mutex::new(None),
            ops_played: AtomicU64::new(0),
            ops_skipped: AtomicU64::new(0),
            source_errors: AtomicU64::new(0),
            dropped_packet_errors: AtomicU64::new(0),
        }
    }

    /// Converts a deadline on the monotonic clock into wall time for
    /// reporting.
    pub(crate) fn to_wall(&self, at: Instant) -> SystemTime {
        self.start_wall + at.saturating_duration_since(self.start_instant)
    }

    /// Whether workers should stop honoring deadlines and drain flat out.
    pub(crate) fn is_draining(&self) -> bool {
        *self.drain_rx.borrow()
    }

    /// Sleeps until `deadline` or until the run flips into draining,
    /// whichever comes first.
    pub(crate) async fn sleep_until(&self, deadline: Instant) {
        if self.is_draining() {
            return;
        }
        let mut drain = self.drain_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = drain.wait_for(|draining| *draining) => {}
        }
    }

    /// Records a fatal error and puts the run into fast drain. The first
    /// fatal error wins.
    pub(crate) fn abort(&self, error: Error) {
        tracing::error!(%error, "aborting replay run");
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(error);
        }
        let _ = self.drain_tx.send(true);
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().unwrap().take()
    }

    pub(crate) fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// How long after the run anchor a capture offset lands, under the
    /// configured speed.
    pub(crate) fn deadline_for(&self, capture_offset: Duration, speed: f64) -> Instant {
        if speed.is_infinite() {
            self.start_instant
        } else {
            self.start_instant + capture_offset.div_f64(speed)
        }
    }
}
