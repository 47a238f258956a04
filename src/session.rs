//! The seam between the replay engine and live server connections.
//!
//! Workers drive everything through these two traits, so tests substitute
//! scripted sessions and embedders can layer TLS or pooling underneath
//! without the engine knowing.

use std::future::Future;

use crate::{
    error::Result,
    op::{ReplySummary, TypedOp},
    options::ServerAddress,
    wire::MessageHeader,
};

/// A reply received from the live server.
#[derive(Clone, Debug)]
pub struct ReplyMessage {
    /// The reply's wire header.
    pub header: MessageHeader,

    /// The reply's decoded body.
    pub op: TypedOp,
}

impl ReplyMessage {
    /// The reply's total size on the wire.
    pub fn wire_bytes(&self) -> u64 {
        self.header.length.max(0) as u64
    }

    /// Summarizes the reply for cursor correlation.
    pub fn summary(&self) -> Result<Option<ReplySummary>> {
        self.op.reply_summary()
    }
}

/// One live connection, owned by exactly one session worker.
pub trait Session: Send + 'static {
    /// Sends `op` to the server under the recorded header's ids and waits
    /// for the reply when the op expects one. `None` means the op was
    /// fire-and-forget.
    fn execute(
        &mut self,
        op: &TypedOp,
        header: &MessageHeader,
    ) -> impl Future<Output = Result<Option<ReplyMessage>>> + Send;

    /// Tears the connection down. Called once, at worker shutdown.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Dial-by-address capability handed to every worker.
pub trait Connect: Clone + Send + Sync + 'static {
    type Session: Session;

    fn connect(
        &self,
        target: &ServerAddress,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}
