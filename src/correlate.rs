//! Pairs recorded replies with the live replies to their replayed requests.
//!
//! The capture contains both halves of every original exchange. Replaying a
//! request produces a third message, the live reply, and translating cursor
//! ids requires lining that live reply up with the recorded reply the
//! original server sent for the same request. The two halves arrive in any
//! order, on any worker, so they meet in a shared table keyed by the
//! exchange they belong to.

use std::sync::Mutex;

use tokio::time::Instant;

use crate::{
    cursor_map::CursorMap,
    op::{RecordedOp, ReplySummary},
    ttl_map::TtlMap,
};

/// Identifies one request/response exchange on one original connection.
///
/// Both halves are keyed in the `(client, server)` orientation: a request
/// already has it, and a recorded reply reaches it by swapping its own
/// endpoints. The id is the request's `request_id`, which the reply carries
/// as `response_to`. `generation` keeps exchanges from a reused socket
/// apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PairKey {
    client: String,
    server: String,
    id: i32,
    generation: u32,
}

/// The two replies to one exchange, in whichever order they arrived.
#[derive(Clone, Copy, Debug, Default)]
struct ReplyPair {
    from_wire: Option<ReplySummary>,
    from_file: Option<ReplySummary>,
}

/// A completed pair reduced to the cursor translation it implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CursorMapping {
    pub(crate) recorded: i64,
    pub(crate) live: i64,
}

#[derive(Debug)]
pub(crate) struct CorrelationTable {
    pending: Mutex<TtlMap<PairKey, ReplyPair>>,
    completed: Mutex<Vec<CursorMapping>>,
}

enum Half {
    FromWire,
    FromFile,
}

impl CorrelationTable {
    pub(crate) fn new(pair_ttl: std::time::Duration) -> Self {
        Self {
            pending: Mutex::new(TtlMap::new(pair_ttl)),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Records the live reply received for the replayed `request`.
    pub(crate) fn add_from_wire(&self, request: &RecordedOp, reply: ReplySummary) {
        let key = PairKey {
            client: request.src_endpoint.clone(),
            server: request.dst_endpoint.clone(),
            id: request.header.request_id,
            generation: request.generation,
        };
        self.add_half(key, Half::FromWire, reply, Instant::now());
    }

    /// Records a reply read from the capture. `reply_op` is the recorded
    /// server-to-client message; swapping its endpoints recovers the
    /// orientation of the request it answers.
    pub(crate) fn add_from_file(&self, reply_op: &RecordedOp, reply: ReplySummary) {
        let key = PairKey {
            client: reply_op.dst_endpoint.clone(),
            server: reply_op.src_endpoint.clone(),
            id: reply_op.header.response_to,
            generation: reply_op.generation,
        };
        self.add_half(key, Half::FromFile, reply, Instant::now());
    }

    fn add_half(&self, key: PairKey, half: Half, reply: ReplySummary, now: Instant) {
        let mapping = {
            let mut pending = self.pending.lock().unwrap();

            let mut pair = pending.get_at(&key, now).copied().unwrap_or_default();
            match half {
                Half::FromWire => pair.from_wire = Some(reply),
                Half::FromFile => pair.from_file = Some(reply),
            }

            match (pair.from_wire, pair.from_file) {
                (Some(from_wire), Some(from_file)) => {
                    pending.remove(&key);
                    if from_file.cursor_id == 0 {
                        None
                    } else {
                        Some(CursorMapping {
                            recorded: from_file.cursor_id,
                            live: from_wire.cursor_id,
                        })
                    }
                }
                _ => {
                    pending.insert_at(key, pair, now);
                    None
                }
            }
        };

        if let Some(mapping) = mapping {
            tracing::debug!(
                recorded = mapping.recorded,
                live = mapping.live,
                "completed a reply pair"
            );
            self.completed.lock().unwrap().push(mapping);
        }
    }

    /// Applies every completed pair's cursor translation. Workers call this
    /// after each op so translations land before the follow-up getMores
    /// that need them.
    pub(crate) fn apply_completed(&self, cursors: &CursorMap) {
        let drained: Vec<CursorMapping> = {
            let mut completed = self.completed.lock().unwrap();
            completed.drain(..).collect()
        };
        for mapping in drained {
            cursors.set(mapping.recorded, mapping.live);
        }
    }

    /// The number of half-complete exchanges currently held.
    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    #[cfg(test)]
    fn add_from_wire_at(&self, request: &RecordedOp, reply: ReplySummary, now: Instant) {
        let key = PairKey {
            client: request.src_endpoint.clone(),
            server: request.dst_endpoint.clone(),
            id: request.header.request_id,
            generation: request.generation,
        };
        self.add_half(key, Half::FromWire, reply, now);
    }

    #[cfg(test)]
    fn add_from_file_at(&self, reply_op: &RecordedOp, reply: ReplySummary, now: Instant) {
        let key = PairKey {
            client: reply_op.dst_endpoint.clone(),
            server: reply_op.src_endpoint.clone(),
            id: reply_op.header.response_to,
            generation: reply_op.generation,
        };
        self.add_half(key, Half::FromFile, reply, now);
    }
}
