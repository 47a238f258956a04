//! Per-connection replay workers.

use std::sync::Arc;

use tokio::{sync::mpsc, time::Instant};

use crate::{
    context::{ExecutionContext, WorkerHandle},
    op::{RecordedOp, TypedOp},
    options::ReplayOptions,
    session::{Connect, Session},
    stats::OpExecution,
};

/// Replays the ops of one logical original connection, in order, against
/// one live session.
pub(crate) struct SessionWorker<C: Connect> {
    connection_num: u64,
    connector: C,
    context: Arc<ExecutionContext>,
    options: Arc<ReplayOptions>,
    receiver: mpsc::Receiver<RecordedOp>,
    _handle: WorkerHandle,
}

impl<C: Connect> SessionWorker<C> {
    /// Spawns the worker task and returns the sender side of its queue.
    /// The worker runs until the queue is closed and drained.
    pub(crate) fn spawn(
        connection_num: u64,
        connector: C,
        context: Arc<ExecutionContext>,
        options: Arc<ReplayOptions>,
        handle: WorkerHandle,
    ) -> mpsc::Sender<RecordedOp> {
        let (sender, receiver) = mpsc::channel(options.queue_capacity);
        let worker = Self {
            connection_num,
            connector,
            context,
            options,
            receiver,
            _handle: handle,
        };
        tokio::spawn(worker.run());
        sender
    }

    async fn run(mut self) {
        // Dial ahead of the replay start so a bursty capture's worth of
        // workers isn't racing TCP handshakes against first deadlines.
        let dial_at = self
            .context
            .start_instant
            .checked_sub(self.options.predial_lead)
            .unwrap_or(self.context.start_instant);
        if Instant::now() < dial_at {
            self.context.sleep_until(dial_at).await;
        }

        let mut session = match self.connector.connect(&self.options.target).await {
            Ok(session) => Some(session),
            Err(error) => {
                // Skip mode: keep draining the queue so the dispatcher is
                // never blocked on a connection that will not come up.
                tracing::warn!(
                    connection_num = self.connection_num,
                    %error,
                    "session dial failed; draining this connection without executing"
                );
                None
            }
        };

        while let Some(op) = self.receiver.recv().await {
            self.process(&mut session, op).await;
        }

        if let Some(session) = session {
            session.close().await;
        }
        tracing::debug!(
            connection_num = self.connection_num,
            "session worker finished"
        );
    }

    async fn process(&self, session: &mut Option<C::Session>, mut op: RecordedOp) {
        op.connection_num = self.connection_num;

        // Replies never wait: they are correlation input, not scheduled
        // work, and holding one back would stall the cursor translations
        // later ops in this queue depend on.
        if let Some(play_at) = op.play_at {
            if !op.is_reply_flavored() && !self.options.uncapped() && Instant::now() < play_at {
                self.context.sleep_until(play_at).await;
            }
        }

        let mut typed = match op.classify() {
            Ok(typed) => typed,
            Err(error) => {
                tracing::debug!(
                    connection_num = self.connection_num,
                    op = crate::op::op_code_label(op.header.op_code),
                    %error,
                    "skipping op that failed to classify"
                );
                ExecutionContext::count(&self.context.ops_skipped);
                return;
            }
        };

        if op.is_reply_flavored() {
            self.record_from_file(&op, &typed);
            self.context
                .correlation
                .apply_completed(&self.context.cursors);
            return;
        }

        if matches!(typed, TypedOp::Unknown) {
            tracing::debug!(
                connection_num = self.connection_num,
                op_code = op.header.op_code,
                "skipping op with unknown opcode"
            );
            ExecutionContext::count(&self.context.ops_skipped);
            return;
        }

        if typed.is_driver_op() {
            tracing::debug!(
                connection_num = self.connection_num,
                command = typed.command_name().unwrap_or(""),
                "skipping driver op"
            );
            ExecutionContext::count(&self.context.ops_skipped);
            return;
        }

        if let Err(error) = self.rewrite_cursors(&mut typed) {
            self.context.abort(error);
            return;
        }

        let Some(session) = session.as_mut() else {
            ExecutionContext::count(&self.context.ops_skipped);
            return;
        };

        let play_at = op.play_at.unwrap_or(self.context.start_instant);
        let played_at = Instant::now();
        let result = session.execute(&typed, &op.header).await;
        let reply_latency = played_at.elapsed();

        let (reply, error) = match result {
            Ok(reply) => (reply, None),
            Err(error) => {
                if error.is_network_error() {
                    // The socket itself failed, not the op; the rest of
                    // this connection's queue will land on a dead session.
                    tracing::error!(
                        connection_num = self.connection_num,
                        op = %typed,
                        %error,
                        "live session I/O failure"
                    );
                } else {
                    tracing::warn!(
                        connection_num = self.connection_num,
                        op = %typed,
                        %error,
                        "op failed on the live server"
                    );
                }
                (None, Some(error.to_string()))
            }
        };

        let record = OpExecution {
            connection_num: self.connection_num,
            op_code: op.header.op_code,
            play_at: self.context.to_wall(play_at),
            played_at: self.context.to_wall(played_at),
            lag: played_at.saturating_duration_since(play_at),
            request_bytes: op.frame_bytes(),
            reply_bytes: reply.as_ref().map(|r| r.wire_bytes()).unwrap_or(0),
            reply_latency,
            error,
        };
        ExecutionContext::count(&self.context.ops_played);
        if let Err(error) = self.context.stats.submit(record).await {
            self.context.abort(error);
            return;
        }

        if let Some(reply) = reply {
            match reply.summary() {
                Ok(Some(summary)) => self.context.correlation.add_from_wire(&op, summary),
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(
                        connection_num = self.connection_num,
                        %error,
                        "could not summarize live reply"
                    );
                }
            }
        }

        self.context
            .correlation
            .apply_completed(&self.context.cursors);
    }

    /// Feeds a recorded reply into the correlation table.
    fn record_from_file(&self, op: &RecordedOp, typed: &TypedOp) {
        match typed.reply_summary() {
            Ok(Some(summary)) => self.context.correlation.add_from_file(op, summary),
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(
                    connection_num = self.connection_num,
                    %error,
                    "could not summarize recorded reply"
                );
            }
        }
    }

    /// Swaps recorded cursor ids for their live counterparts. Unmapped ids
    /// pass through so the op still replays, even though the live server
    /// will likely reject it.
    fn rewrite_cursors(&self, typed: &mut TypedOp) -> crate::error::Result<()> {
        let recorded_ids = typed.cursor_ids();
        if recorded_ids.is_empty() {
            return Ok(());
        }

        let mapped: Vec<i64> = recorded_ids
            .iter()
            .map(|&id| {
                if id == 0 {
                    return id;
                }
                match self.context.cursors.get(id) {
                    Some(live) => live,
                    None => {
                        tracing::warn!(
                            connection_num = self.connection_num,
                            cursor_id = id,
                            "missing mapped cursor id; replaying the recorded id"
                        );
                        id
                    }
                }
            })
            .collect();

        if mapped != recorded_ids {
            typed.set_cursor_ids(&mapped)?;
        }
        Ok(())
    }
}
