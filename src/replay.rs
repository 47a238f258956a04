//! The replay run entry point.

use std::sync::Arc;

use crate::{
    context::{ExecutionContext, WorkerHandleListener},
    dispatch::Dispatcher,
    error::Result,
    options::ReplayOptions,
    session::Connect,
    source::OpSource,
    stats::StatSink,
};

/// Drives recorded operations against a live deployment.
///
/// One `Replay` value describes one configured engine; each call to
/// [`run`](Replay::run) performs one complete pass over an op source. No
/// state carries over between runs.
#[derive(Clone, Debug)]
pub struct Replay<C: Connect> {
    options: Arc<ReplayOptions>,
    connector: C,
}

/// What a completed run did, for reporting and exit-code mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReplaySummary {
    /// Ops executed against the live server (including ones the server
    /// answered with an error).
    pub ops_played: u64,

    /// Ops skipped: driver chatter, unknown opcodes, unclassifiable
    /// bodies, and ops drained by workers in skip mode.
    pub ops_skipped: u64,

    /// Decode errors the op source yielded.
    pub source_errors: u64,

    /// How many of those decode errors reported capture-time packet loss.
    pub dropped_packet_errors: u64,
}

impl ReplaySummary {
    /// Whether the run completed but replayed a capture with packet loss.
    /// Embedding CLIs give this outcome its own exit code.
    pub fn packets_were_dropped(&self) -> bool {
        self.dropped_packet_errors > 0
    }
}

impl<C: Connect> Replay<C> {
    /// Creates an engine from validated options and a dialing capability.
    pub fn new(options: ReplayOptions, connector: C) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            connector,
        })
    }

    /// Replays `source` to completion.
    ///
    /// Per-op outcomes flow to `stats`; the returned summary gives run
    /// totals. An error return means the run aborted on a fatal condition;
    /// ops already handed to workers were still drained before returning.
    pub async fn run<S: OpSource>(&self, source: S, stats: StatSink) -> Result<ReplaySummary> {
        let context = Arc::new(ExecutionContext::new(&self.options, stats));
        let (handle, mut listener) = WorkerHandleListener::channel();

        let dispatcher = Dispatcher::new(
            self.connector.clone(),
            context.clone(),
            self.options.clone(),
            handle,
        );

        // The dispatcher owns every queue sender and the worker-handle
        // prototype; returning from run drops both, so workers see their
        // queues close and the barrier can release.
        let outcome = dispatcher.run(source).await;
        if let Err(error) = outcome {
            context.abort(error);
        }

        listener.wait_for_all_handle_drops().await;

        if let Some(fatal) = context.take_fatal() {
            return Err(fatal);
        }

        let summary = ReplaySummary {
            ops_played: ExecutionContext::load(&context.ops_played),
            ops_skipped: ExecutionContext::load(&context.ops_skipped),
            source_errors: ExecutionContext::load(&context.source_errors),
            dropped_packet_errors: ExecutionContext::load(&context.dropped_packet_errors),
        };
        tracing::info!(
            ops_played = summary.ops_played,
            ops_skipped = summary.ops_skipped,
            source_errors = summary.source_errors,
            "replay run complete"
        );
        Ok(summary)
    }
}
