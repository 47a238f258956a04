//! Routes the global op stream onto per-connection workers.

use std::{
    collections::HashMap,
    sync::Arc,
    time::SystemTime,
};

use tokio::sync::mpsc;

use crate::{
    context::{ExecutionContext, WorkerHandle},
    error::{Error, Result},
    op::RecordedOp,
    options::ReplayOptions,
    session::Connect,
    source::{OpSource, SourceItem},
    worker::SessionWorker,
};

/// The two endpoints of a captured TCP stream, order-normalized so that
/// both directions of the conversation land on the same worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EndpointPair {
    lower: String,
    upper: String,
}

impl EndpointPair {
    fn normalized(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                lower: a.to_string(),
                upper: b.to_string(),
            }
        } else {
            Self {
                lower: b.to_string(),
                upper: a.to_string(),
            }
        }
    }
}

#[derive(Debug)]
struct EndpointState {
    connection_num: u64,
    generation: u32,
    last_seen: SystemTime,
}

/// Pulls from the op source in arrival order, stamps deadlines and
/// connection identity, and feeds each op to its worker's queue.
pub(crate) struct Dispatcher<C: Connect> {
    connector: C,
    context: Arc<ExecutionContext>,
    options: Arc<ReplayOptions>,
    handle: WorkerHandle,
    workers: HashMap<u64, mpsc::Sender<RecordedOp>>,
    endpoints: HashMap<EndpointPair, EndpointState>,
    next_connection_num: u64,
    capture_epoch: Option<SystemTime>,
}

impl<C: Connect> Dispatcher<C> {
    pub(crate) fn new(
        connector: C,
        context: Arc<ExecutionContext>,
        options: Arc<ReplayOptions>,
        handle: WorkerHandle,
    ) -> Self {
        Self {
            connector,
            context,
            options,
            handle,
            workers: HashMap::new(),
            endpoints: HashMap::new(),
            next_connection_num: 0,
            capture_epoch: None,
        }
    }

    /// Consumes the source to EOF. Dropping the dispatcher afterwards
    /// closes every worker queue, which is what lets workers finish.
    pub(crate) async fn run<S: OpSource>(mut self, mut source: S) -> Result<()> {
        while let Some(item) = source.next().await {
            match item {
                SourceItem::Op(op) => self.dispatch(op).await?,
                SourceItem::Err(error) => {
                    ExecutionContext::count(&self.context.source_errors);
                    if error.is_packets_dropped() {
                        ExecutionContext::count(&self.context.dropped_packet_errors);
                    }
                    if error.is_fatal() {
                        return Err(error);
                    }
                    tracing::warn!(%error, "op source yielded a decode error; continuing");
                }
            }
        }
        tracing::debug!(
            connections = self.endpoints.len(),
            "op source exhausted; closing worker queues"
        );
        Ok(())
    }

    async fn dispatch(&mut self, mut op: RecordedOp) -> Result<()> {
        // The first op anchors the capture time base; every deadline is its
        // offset from that anchor, compressed by the speed factor.
        let epoch = *self.capture_epoch.get_or_insert(op.seen_at);
        let offset = op.seen_at.duration_since(epoch).unwrap_or_default();
        op.play_at = Some(self.context.deadline_for(offset, self.options.speed));

        let key = EndpointPair::normalized(&op.src_endpoint, &op.dst_endpoint);
        let (connection_num, generation) = match self.endpoints.get_mut(&key) {
            Some(state) => {
                let gap = op
                    .seen_at
                    .duration_since(state.last_seen)
                    .unwrap_or_default();
                if gap > self.options.idle_gap_for_new_generation {
                    // Socket reuse: same endpoints, but long enough idle
                    // that this must be a new original connection. Closing
                    // the old queue lets the finished incarnation drain out.
                    self.workers.remove(&state.connection_num);
                    state.generation += 1;
                    state.connection_num = self.next_connection_num;
                    self.next_connection_num += 1;
                    tracing::debug!(
                        connection_num = state.connection_num,
                        generation = state.generation,
                        gap_secs = gap.as_secs(),
                        "endpoint pair reused; starting a new generation"
                    );
                }
                state.last_seen = op.seen_at;
                (state.connection_num, state.generation)
            }
            None => {
                let connection_num = self.next_connection_num;
                self.next_connection_num += 1;
                self.endpoints.insert(
                    key,
                    EndpointState {
                        connection_num,
                        generation: 0,
                        last_seen: op.seen_at,
                    },
                );
                (connection_num, 0)
            }
        };
        op.connection_num = connection_num;
        op.generation = generation;

        if !self.workers.contains_key(&connection_num) {
            let sender = SessionWorker::spawn(
                connection_num,
                self.connector.clone(),
                self.context.clone(),
                self.options.clone(),
                self.handle.clone(),
            );
            self.workers.insert(connection_num, sender);
        }
        let sender = match self.workers.get(&connection_num) {
            Some(sender) => sender,
            None => return Err(Error::internal("worker queue missing after spawn")),
        };

        // A full queue blocks here, halting source consumption until the
        // slow worker catches up.
        sender.send(op).await.map_err(|_| {
            Error::internal("a session worker dropped its queue while ops remained for it")
        })
    }
}
