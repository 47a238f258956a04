//! Per-op execution records and the channel that delivers them.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use futures_core::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub(crate) const STAT_CHANNEL_CAPACITY: usize = 4096;

/// The finalized record of one executed op.
///
/// The engine emits exactly one of these per non-skipped op; skipped ops
/// (driver chatter, replies, unknown opcodes, skip-mode workers) emit none.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct OpExecution {
    /// The logical original connection the op replayed on.
    pub connection_num: u64,

    /// The raw wire opcode.
    pub op_code: i32,

    /// When the op was scheduled to execute.
    pub play_at: SystemTime,

    /// When the op actually executed.
    pub played_at: SystemTime,

    /// `played_at − play_at`; zero when the worker was not behind.
    pub lag: Duration,

    /// Size of the request frame on the wire, header included.
    pub request_bytes: u64,

    /// Size of the live reply frame, or 0 when there was none.
    pub reply_bytes: u64,

    /// How long the live server took to answer.
    pub reply_latency: Duration,

    /// The execute error, if the op failed on the live server.
    pub error: Option<String>,
}

/// Producer handle for execution records; cloned into every worker.
#[derive(Clone, Debug)]
pub struct StatSink {
    sender: mpsc::Sender<OpExecution>,
}

impl StatSink {
    /// Delivers one record, applying backpressure when the consumer lags.
    ///
    /// A closed consumer is an engine-fatal condition: the contract is one
    /// record per executed op, and a sink that vanished mid-run can no
    /// longer honor it.
    pub(crate) async fn submit(&self, record: OpExecution) -> Result<()> {
        self.sender
            .send(record)
            .await
            .map_err(|_| Error::internal("the stat sink was closed while ops were in flight"))
    }
}

/// Creates the stat channel: the engine keeps the sink, the embedder keeps
/// the receiver.
pub fn channel() -> (StatSink, mpsc::Receiver<OpExecution>) {
    let (sender, receiver) = mpsc::channel(STAT_CHANNEL_CAPACITY);
    (StatSink { sender }, receiver)
}

/// Collects records into memory. Convenient for tests and for embedders
/// that only want totals after the run.
#[derive(Debug)]
pub struct StatCollector {
    receiver: mpsc::Receiver<OpExecution>,
}

impl StatCollector {
    /// Wraps the receiver half of the stat channel.
    pub fn new(receiver: mpsc::Receiver<OpExecution>) -> Self {
        Self { receiver }
    }

    /// Drains the channel until every sink handle has been dropped.
    pub async fn collect_all(mut self) -> Vec<OpExecution> {
        let mut records = Vec::new();
        while let Some(record) = self.receiver.recv().await {
            records.push(record);
        }
        records
    }
}

impl Stream for StatCollector {
    type Item = OpExecution;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, SystemTime};

    use super::{channel, OpExecution, StatCollector};

    fn record(connection_num: u64) -> OpExecution {
        OpExecution {
            connection_num,
            op_code: 2004,
            play_at: SystemTime::UNIX_EPOCH,
            played_at: SystemTime::UNIX_EPOCH,
            lag: Duration::ZERO,
            request_bytes: 64,
            reply_bytes: 0,
            reply_latency: Duration::ZERO,
            error: None,
        }
    }

    #[tokio::test]
    async fn collector_sees_all_records_in_order() {
        let (sink, receiver) = channel();
        let collector = tokio::spawn(StatCollector::new(receiver).collect_all());

        for i in 0..3 {
            sink.submit(record(i)).await.unwrap();
        }
        drop(sink);

        let records = collector.await.unwrap();
        let nums: Vec<u64> = records.iter().map(|r| r.connection_num).collect();
        assert_eq!(nums, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn collector_is_a_stream() {
        use futures::StreamExt;

        let (sink, receiver) = channel();
        sink.submit(record(7)).await.unwrap();
        drop(sink);

        let mut collector = StatCollector::new(receiver);
        assert_eq!(collector.next().await.unwrap().connection_num, 7);
        assert!(collector.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_sink_is_fatal() {
        let (sink, receiver) = channel();
        drop(receiver);
        let err = sink.submit(record(0)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
