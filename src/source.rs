//! The contract between the engine and whatever decodes a capture.

use std::{collections::VecDeque, future::Future};

use crate::{error::Error, op::RecordedOp};

/// One yield from an op source.
#[derive(Clone, Debug)]
pub enum SourceItem {
    /// The next recorded op, in original capture order.
    Op(RecordedOp),

    /// The source failed to decode a message. The run continues; an error
    /// whose kind is `PacketsDropped` additionally marks the run's outcome.
    Err(Error),
}

/// A lazy, finite, single-pass sequence of recorded operations.
///
/// The decoder behind this trait is responsible for in-stream ordering:
/// ops for one `(src, dst)` pair must arrive in original capture order.
pub trait OpSource {
    /// Yields the next item, or `None` at end of capture.
    fn next(&mut self) -> impl Future<Output = Option<SourceItem>> + Send;
}

/// An op source over an in-memory sequence, for tests and for embedders
/// that decode a capture container themselves.
#[derive(Debug, Default)]
pub struct BufferedSource {
    items: VecDeque<SourceItem>,
}

impl BufferedSource {
    /// A source over a fixed sequence of yields, decode errors included.
    pub fn new(items: impl IntoIterator<Item = SourceItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    /// A source over ops alone, with no decode errors.
    pub fn from_ops(ops: impl IntoIterator<Item = RecordedOp>) -> Self {
        Self::new(ops.into_iter().map(SourceItem::Op))
    }
}

impl OpSource for BufferedSource {
    async fn next(&mut self) -> Option<SourceItem> {
        self.items.pop_front()
    }
}
