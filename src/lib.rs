//! A replay execution engine for recorded MongoDB wire-protocol traffic.
//!
//! The engine consumes a lazy stream of captured operations and drives them
//! against a live deployment across one worker per original connection,
//! preserving per-connection order, honoring each op's scheduled play time
//! under a configurable speed factor, and rewriting server-assigned cursor
//! ids so follow-up `getMore` and `killCursors` ops land on live cursors.
//!
//! ```no_run
//! use mongoreplay::{
//!     options::{ReplayOptions, ServerAddress},
//!     source::BufferedSource,
//!     Replay, TcpConnector,
//! };
//!
//! # async fn example(ops: Vec<mongoreplay::op::RecordedOp>) -> mongoreplay::error::Result<()> {
//! let options = ReplayOptions::builder()
//!     .target(ServerAddress::parse("localhost:27017")?)
//!     .speed(2.0)
//!     .build();
//!
//! let (sink, stats) = mongoreplay::stats::channel();
//! let collector = tokio::spawn(mongoreplay::stats::StatCollector::new(stats).collect_all());
//!
//! let replay = Replay::new(options, TcpConnector)?;
//! let summary = replay.run(BufferedSource::from_ops(ops), sink).await?;
//!
//! let records = collector.await.unwrap();
//! println!("played {} ops ({} records)", summary.ops_played, records.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]

mod conn;
mod context;
mod correlate;
mod cursor_map;
mod dispatch;
pub mod error;
#[allow(missing_docs)]
pub mod op;
pub mod options;
mod replay;
pub mod session;
pub mod source;
pub mod stats;
mod ttl_map;
#[allow(missing_docs)]
pub mod wire;
mod worker;

pub use crate::{
    conn::{TcpConnector, TcpSession},
    replay::{Replay, ReplaySummary},
};
