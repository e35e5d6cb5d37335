//! Process-wide counters, safe to read from a signal handler: every
//! load here is `Ordering::Relaxed`, nothing allocates, and nothing
//! takes the manager's state mutex.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    bytes_swapped_in: AtomicU64,
    bytes_swapped_out: AtomicU64,
    swap_actions_queued: AtomicU64,
    cached_swap_hits: AtomicU64,
}

/// A point-in-time copy of the counters in [`Stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_swapped_in: u64,
    pub bytes_swapped_out: u64,
    pub swap_actions_queued: u64,
    pub cached_swap_hits: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "swapped_in={} swapped_out={} actions_queued={} cached_hits={}",
            self.bytes_swapped_in, self.bytes_swapped_out, self.swap_actions_queued, self.cached_swap_hits
        )
    }
}

impl Stats {
    pub(crate) fn record_swap_in(&self, bytes: usize) {
        self.bytes_swapped_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_swap_out(&self, bytes: usize) {
        self.bytes_swapped_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_action_queued(&self) {
        self.swap_actions_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cached_hit(&self) {
        self.cached_swap_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot for reporting.  Individual
    /// fields may be read out of sync with each other under
    /// concurrent updates; that is acceptable for statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_swapped_in: self.bytes_swapped_in.load(Ordering::Relaxed),
            bytes_swapped_out: self.bytes_swapped_out.load(Ordering::Relaxed),
            swap_actions_queued: self.swap_actions_queued.load(Ordering::Relaxed),
            cached_swap_hits: self.cached_swap_hits.load(Ordering::Relaxed),
        }
    }
}
