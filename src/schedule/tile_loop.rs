//! One-ahead tile loop.
//!
//! Iteration `i` executes tile `i` and prefetches tile `i + 1`:
//!
//! ```text
//! prologue:  load t0 ─────────────────────────────┐
//! iter 0:    load t1 │ compute t0 │ write back t0 │
//! iter 1:    load t2 │ compute t1 │ write back t1 │
//! ...
//! iter N-1:          │ compute tN-1 │ write back tN-1
//! ```
//!
//! The controller owns every piece of loop state: the exec coordinate, the
//! parity bits and the prefetch counters.

use crate::layer::{GridDims, PaddingFlags, TileCoord};

use super::double_buffer::{DoubleBufferScheduler, SlotAssignment};

/// Everything one iteration needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPlan {
    pub index: usize,
    /// Tile computed and written back this iteration
    pub exec: TileCoord,
    /// Tile prefetched this iteration, `None` on the final one
    pub load: Option<TileCoord>,
    pub slots: SlotAssignment,
    /// The prefetch includes a weight tile and requant pair
    pub reload_weights: bool,
    /// Padding flags of the exec tile
    pub padding: PaddingFlags,
}

impl IterationPlan {
    #[inline]
    pub fn is_final(&self) -> bool {
        self.load.is_none()
    }
}

/// Drives the tile loop over a grid.
#[derive(Debug, Clone)]
pub struct TileLoopController {
    grid: GridDims,
    scheduler: DoubleBufferScheduler,
    /// Tile the next iteration executes
    exec: Option<TileCoord>,
    index: usize,
    prefetches: usize,
    weight_reloads: usize,
}

impl TileLoopController {
    pub fn new(grid: GridDims) -> Self {
        let exec = if grid.total() == 0 { None } else { Some(TileCoord::ORIGIN) };
        Self {
            grid,
            scheduler: DoubleBufferScheduler::new(),
            exec,
            index: 0,
            prefetches: 0,
            weight_reloads: 0,
        }
    }

    pub fn grid(&self) -> GridDims {
        self.grid
    }

    /// Iterations in the whole loop.
    pub fn total(&self) -> usize {
        self.grid.total()
    }

    /// Input prefetches issued so far.
    pub fn prefetches(&self) -> usize {
        self.prefetches
    }

    /// Weight reloads issued so far (the prologue load excluded).
    pub fn weight_reloads(&self) -> usize {
        self.weight_reloads
    }
}

impl Iterator for TileLoopController {
    type Item = IterationPlan;

    fn next(&mut self) -> Option<IterationPlan> {
        let exec = self.exec?;
        let load = self.grid.next(exec);
        let reload_weights = load.is_some_and(|l| l.changes_channel_block(&exec));

        let plan = IterationPlan {
            index: self.index,
            exec,
            load,
            slots: self.scheduler.advance(reload_weights),
            reload_weights,
            padding: self.grid.padding_flags(exec),
        };

        if load.is_some() {
            self.prefetches += 1;
        }
        if reload_weights {
            self.weight_reloads += 1;
        }
        self.exec = load;
        self.index += 1;
        Some(plan)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.total().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileLoopController {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Parity;
    use proptest::prelude::*;

    #[test]
    fn test_two_by_two_by_one() {
        let plans: Vec<IterationPlan> = TileLoopController::new(GridDims::new(2, 2, 1)).collect();
        assert_eq!(plans.len(), 4);

        // iterations 0 and 1 share the weight slot loaded by the prologue
        assert_eq!(plans[0].slots.weights.exec, Parity::A);
        assert_eq!(plans[1].slots.weights.exec, Parity::A);

        // reload for channel block 1 issued during iteration 1
        assert!(!plans[0].reload_weights);
        assert!(plans[1].reload_weights);
        assert_eq!(plans[1].load, Some(TileCoord::new(1, 0, 0)));
        assert_eq!(plans[2].slots.weights.exec, plans[1].slots.weights.load);
        assert!(!plans[2].reload_weights);
        assert!(!plans[3].reload_weights);

        let vertical: Vec<(bool, bool)> = plans
            .iter()
            .map(|p| (p.padding.top, p.padding.bottom))
            .collect();
        assert_eq!(vertical, vec![(true, false), (false, true), (true, false), (false, true)]);

        let execs: Vec<TileCoord> = plans.iter().map(|p| p.exec).collect();
        assert_eq!(execs, GridDims::new(2, 2, 1).iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_single_tile() {
        let mut controller = TileLoopController::new(GridDims::new(1, 1, 1));
        let plan = controller.next().unwrap();
        assert!(plan.is_final());
        assert!(!plan.reload_weights);
        assert!(controller.next().is_none());
        assert_eq!(controller.prefetches(), 0);
    }

    #[test]
    fn test_counters() {
        let mut controller = TileLoopController::new(GridDims::new(8, 1, 1));
        assert_eq!(controller.len(), 8);
        controller.by_ref().for_each(drop);
        assert_eq!(controller.prefetches(), 7);
        assert_eq!(controller.weight_reloads(), 7);
    }

    proptest! {
        #[test]
        fn prop_prefetch_count(c in 1usize..5, h in 1usize..5, w in 1usize..5) {
            let mut controller = TileLoopController::new(GridDims::new(c, h, w));
            let plans: Vec<IterationPlan> = controller.by_ref().collect();

            prop_assert_eq!(plans.len(), c * h * w);
            prop_assert_eq!(controller.prefetches(), c * h * w - 1);
            prop_assert_eq!(controller.weight_reloads(), c - 1);
            prop_assert!(plans.last().unwrap().is_final());
        }

        #[test]
        fn prop_exec_slot_was_loaded_before(c in 1usize..5, h in 1usize..5, w in 1usize..5) {
            let plans: Vec<IterationPlan> =
                TileLoopController::new(GridDims::new(c, h, w)).collect();

            // prologue fills slot A of every role
            prop_assert_eq!(plans[0].slots.input.exec, Parity::A);
            prop_assert_eq!(plans[0].slots.weights.exec, Parity::A);

            let mut weight_slot = Parity::A;
            for pair in plans.windows(2) {
                let (prev, cur) = (&pair[0], &pair[1]);
                prop_assert_eq!(prev.load, Some(cur.exec));
                prop_assert_eq!(cur.slots.input.exec, prev.slots.input.load);
                if prev.reload_weights {
                    weight_slot = prev.slots.weights.load;
                }
                prop_assert_eq!(cur.slots.weights.exec, weight_slot);
            }
        }
    }
}
