//! Double-buffer parity state.
//!
//! Each role owns two slots. The exec slot is the one compute reads (or,
//! for the output role, writes); the load slot is the one a prefetch may
//! fill. The two are always different.
//!
//! | Role            | Flips                                  |
//! |-----------------|----------------------------------------|
//! | input           | every iteration                        |
//! | weights/requant | when the next tile changes channel block |
//! | output          | every iteration                        |

use crate::layer::Parity;

/// Load and exec slot of one role for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSlots {
    pub load: Parity,
    pub exec: Parity,
}

impl RoleSlots {
    fn from_exec(exec: Parity) -> Self {
        Self { load: exec.flip(), exec }
    }
}

/// Slots of every role for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAssignment {
    pub input: RoleSlots,
    /// Shared by the weight tile and the requant pair
    pub weights: RoleSlots,
    /// Output slot compute writes and the write-back reads
    pub output: Parity,
}

/// Parity bits of the input, weight and output roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoubleBufferScheduler {
    input: Parity,
    weights: Parity,
    output: Parity,
}

impl DoubleBufferScheduler {
    /// All roles start executing from slot A, where the prologue loads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve this iteration's slots and step the state.
    ///
    /// `channel_changes` is whether the tile loaded this iteration needs a
    /// different weight tile than the one executing.
    pub fn advance(&mut self, channel_changes: bool) -> SlotAssignment {
        let slots = SlotAssignment {
            input: RoleSlots::from_exec(self.input),
            weights: RoleSlots::from_exec(self.weights),
            output: self.output,
        };

        self.input = self.input.flip();
        self.output = self.output.flip();
        if channel_changes {
            self.weights = self.weights.flip();
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_exec_is_a() {
        let mut scheduler = DoubleBufferScheduler::new();
        let slots = scheduler.advance(false);
        assert_eq!(slots.input, RoleSlots { load: Parity::B, exec: Parity::A });
        assert_eq!(slots.weights, RoleSlots { load: Parity::B, exec: Parity::A });
        assert_eq!(slots.output, Parity::A);
    }

    #[test]
    fn test_input_and_output_alternate() {
        let mut scheduler = DoubleBufferScheduler::new();
        let execs: Vec<(Parity, Parity)> = (0..4)
            .map(|_| {
                let s = scheduler.advance(false);
                (s.input.exec, s.output)
            })
            .collect();

        assert_eq!(execs, vec![
            (Parity::A, Parity::A),
            (Parity::B, Parity::B),
            (Parity::A, Parity::A),
            (Parity::B, Parity::B),
        ]);
    }

    #[test]
    fn test_weights_flip_on_channel_change_only() {
        let mut scheduler = DoubleBufferScheduler::new();

        let first = scheduler.advance(false);
        let second = scheduler.advance(true);
        let third = scheduler.advance(false);

        assert_eq!(first.weights.exec, Parity::A);
        assert_eq!(second.weights.exec, Parity::A);
        // reload went into B during the second iteration
        assert_eq!(second.weights.load, Parity::B);
        assert_eq!(third.weights.exec, Parity::B);
    }

    #[test]
    fn test_load_never_equals_exec() {
        let mut scheduler = DoubleBufferScheduler::new();
        for i in 0..16 {
            let slots = scheduler.advance(i % 3 == 0);
            assert_ne!(slots.input.load, slots.input.exec);
            assert_ne!(slots.weights.load, slots.weights.exec);
        }
    }
}
