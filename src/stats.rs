use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the components of one stream manager
///
/// Counters survive start/stop cycles; they only ever grow.
#[derive(Debug, Default)]
pub struct StreamStats {
    received: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
    recorded: AtomicU64,
    persistence_errors: AtomicU64,
    record_dropped: AtomicU64,
    replayed: AtomicU64,
    replay_skipped: AtomicU64,
    replay_failed: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub recorded: u64,
    pub persistence_errors: u64,
    /// Envelopes not recorded because the writer fell behind
    pub record_dropped: u64,
    pub replayed: u64,
    pub replay_skipped: u64,
    pub replay_failed: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl StreamStats {
    counter!(inc_received, received);
    counter!(inc_dropped, dropped);
    counter!(inc_dispatched, dispatched);
    counter!(inc_handler_failures, handler_failures);
    counter!(inc_recorded, recorded);
    counter!(inc_persistence_errors, persistence_errors);
    counter!(inc_record_dropped, record_dropped);
    counter!(inc_replayed, replayed);
    counter!(inc_replay_skipped, replay_skipped);
    counter!(inc_replay_failed, replay_failed);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            record_dropped: self.record_dropped.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            replay_skipped: self.replay_skipped.load(Ordering::Relaxed),
            replay_failed: self.replay_failed.load(Ordering::Relaxed),
        }
    }
}
