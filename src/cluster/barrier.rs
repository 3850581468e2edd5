//! Team barrier with participation tracking.
//!
//! Wraps [`std::sync::Barrier`] for a fixed group of units and records how
//! often the team synchronized and how long units sat waiting for the last
//! arrival.
//!
//! # Usage
//!
//! ```
//! use cluster_tiler::cluster::{run_team, TeamBarrier};
//!
//! let barrier = TeamBarrier::new(4);
//! run_team(4, |_unit| {
//!     barrier.wait();
//!     barrier.wait();
//! });
//! assert_eq!(barrier.stats().completions, 2);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;
use std::time::Instant;

/// Barrier statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierStats {
    /// Number of barrier completions.
    pub completions: u64,
    /// Individual arrivals across all units.
    pub arrivals: u64,
    /// Total time units spent blocked, in nanoseconds.
    pub total_wait_ns: u64,
    /// Longest single wait, in nanoseconds.
    pub max_wait_ns: u64,
}

impl BarrierStats {
    /// Average wait per arrival in nanoseconds.
    pub fn avg_wait_ns(&self) -> f64 {
        if self.arrivals == 0 {
            0.0
        } else {
            self.total_wait_ns as f64 / self.arrivals as f64
        }
    }
}

/// Reusable barrier for a team of `participants` units.
#[derive(Debug)]
pub struct TeamBarrier {
    barrier: Barrier,
    participants: usize,
    completions: AtomicU64,
    arrivals: AtomicU64,
    total_wait_ns: AtomicU64,
    max_wait_ns: AtomicU64,
}

impl TeamBarrier {
    pub fn new(participants: usize) -> Self {
        let participants = participants.max(1);
        Self {
            barrier: Barrier::new(participants),
            participants,
            completions: AtomicU64::new(0),
            arrivals: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
            max_wait_ns: AtomicU64::new(0),
        }
    }

    /// Number of units that must arrive.
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Block until every participant has arrived.
    ///
    /// Returns true on exactly one unit per completion.
    pub fn wait(&self) -> bool {
        let start = Instant::now();
        let result = self.barrier.wait();
        let waited = start.elapsed().as_nanos() as u64;

        self.arrivals.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ns.fetch_add(waited, Ordering::Relaxed);
        self.max_wait_ns.fetch_max(waited, Ordering::Relaxed);
        if result.is_leader() {
            self.completions.fetch_add(1, Ordering::Relaxed);
        }
        result.is_leader()
    }

    /// Snapshot of the statistics.
    ///
    /// Only consistent once the team has left the barrier.
    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            completions: self.completions.load(Ordering::Relaxed),
            arrivals: self.arrivals.load(Ordering::Relaxed),
            total_wait_ns: self.total_wait_ns.load(Ordering::Relaxed),
            max_wait_ns: self.max_wait_ns.load(Ordering::Relaxed),
        }
    }
}
