//! Replica counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifetime counters of one replica
#[derive(Debug, Default)]
pub struct ReplicaStats {
    received: AtomicU64,
    writes_applied: AtomicU64,
    reads_answered: AtomicU64,
    duplicates_skipped: AtomicU64,
    discarded: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time copy of [`ReplicaStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub writes_applied: u64,
    pub reads_answered: u64,
    pub duplicates_skipped: u64,
    pub discarded: u64,
    pub requeued: u64,
}

impl ReplicaStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.writes_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_answered(&self) {
        self.reads_answered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            writes_applied: self.writes_applied.load(Ordering::Relaxed),
            reads_answered: self.reads_answered.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}
