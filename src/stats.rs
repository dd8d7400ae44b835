//! Lock-free counters for the media and result planes.
//!
//! Counters are updated from the hot paths with relaxed atomics and read
//! as plain snapshots for logging and tests.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the packet demultiplexer.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub datagrams: AtomicU64,
    pub short_dropped: AtomicU64,
    pub unrouted_dropped: AtomicU64,
    pub routed_bytes: AtomicU64,
    pub receive_errors: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub datagrams: u64,
    pub short_dropped: u64,
    pub unrouted_dropped: u64,
    pub routed_bytes: u64,
    pub receive_errors: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            short_dropped: self.short_dropped.load(Ordering::Relaxed),
            unrouted_dropped: self.unrouted_dropped.load(Ordering::Relaxed),
            routed_bytes: self.routed_bytes.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Counters maintained by the result publisher and its event sink.
#[derive(Debug, Default)]
pub struct PublishStats {
    pub published: AtomicU64,
    /// Events rejected because the hand-off queue was full.
    pub queue_dropped: AtomicU64,
    /// Events dropped after the bus retry budget was exhausted.
    pub publish_dropped: AtomicU64,
}

/// Point-in-time copy of [`PublishStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishSnapshot {
    pub published: u64,
    pub queue_dropped: u64,
    pub publish_dropped: u64,
}

impl PublishStats {
    pub fn snapshot(&self) -> PublishSnapshot {
        PublishSnapshot {
            published: self.published.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Increment a counter by one.
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
