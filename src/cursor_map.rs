//! Translation from recorded cursor ids to their live counterparts.

use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

use crate::ttl_map::TtlMap;

/// Maps the cursor ids the original server assigned to the ids the live
/// server assigned for the same logical cursors.
///
/// Entries live for a fixed TTL from their most recent write; a remapping
/// written twice keeps the later value (a new generation of the exchange
/// took the id over). Zero is "no cursor" on the wire and is never stored.
#[derive(Debug)]
pub(crate) struct CursorMap {
    inner: Mutex<TtlMap<i64, i64>>,
}

impl CursorMap {
    pub(crate) fn new(cursor_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(TtlMap::new(cursor_ttl)),
        }
    }

    /// Records that recorded cursor `recorded` is live cursor `live`.
    pub(crate) fn set(&self, recorded: i64, live: i64) {
        if recorded == 0 {
            return;
        }
        self.inner.lock().unwrap().insert(recorded, live);
    }

    /// Looks up the live id for a recorded cursor id.
    pub(crate) fn get(&self, recorded: i64) -> Option<i64> {
        self.get_at(recorded, Instant::now())
    }

    pub(crate) fn get_at(&self, recorded: i64, now: Instant) -> Option<i64> {
        self.inner.lock().unwrap().get_at(&recorded, now).copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn set_at(&self, recorded: i64, live: i64, now: Instant) {
        if recorded == 0 {
            return;
        }
        self.inner.lock().unwrap().insert_at(recorded, live, now);
    }
}
