//! SPMD execution units.
//!
//! A team of `N` units runs the same control flow on scoped threads. Unit 0
//! is the leader; the only place control flow diverges on it is the
//! weight/requant transfer election.

pub mod barrier;

pub use barrier::{BarrierStats, TeamBarrier};

use std::thread;

/// Identity of one unit in a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub index: usize,
    pub team_size: usize,
}

impl UnitId {
    pub fn new(index: usize, team_size: usize) -> Self {
        Self { index, team_size }
    }

    /// Unit 0 issues the transfers nobody else may duplicate.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.index == 0
    }

    /// Contiguous share `[start, end)` of `items` owned by this unit.
    pub fn share(&self, items: usize) -> std::ops::Range<usize> {
        let chunk = items.div_ceil(self.team_size.max(1));
        let start = (self.index * chunk).min(items);
        start..(start + chunk).min(items)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit {}/{}", self.index, self.team_size)
    }
}

/// Run `body` on `units` scoped threads and collect the results in unit order.
///
/// A panic in any unit is re-raised on the caller once the team has joined.
pub fn run_team<F, R>(units: usize, body: F) -> Vec<R>
where
    F: Fn(UnitId) -> R + Sync,
    R: Send,
{
    let units = units.max(1);
    let body = &body;

    thread::scope(|s| {
        let handles: Vec<_> = (0..units)
            .map(|index| s.spawn(move || body(UnitId::new(index, units))))
            .collect();

        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
