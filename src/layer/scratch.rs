//! Static partition of the local scratchpad.
//!
//! Every double-buffered role gets two adjacent slots sized for its largest
//! tile, followed by the kernel workspace:
//!
//! ```text
//! base ─► ┌─────────┬─────────┐
//!         │ input A │ input B │
//!         ├─────────┼─────────┤
//!         │ out A   │ out B   │
//!         ├─────────┼─────────┤
//!         │ wgt A   │ wgt B   │
//!         ├─────────┼─────────┤
//!         │ k/l A   │ k/l B   │   kappa[C_blk] then lambda[C_blk]
//!         ├─────────┴─────────┤
//!         │     workspace     │
//!         └───────────────────┘
//! ```
//!
//! Offsets are relative to the scratchpad base word of the parameter block.
//! Every slot starts 4-byte aligned.

use thiserror::Error;

use super::addressing::Span;
use super::LayerGeometry;

const ALIGN: usize = 4;

/// Scratchpad does not fit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("scratchpad layout needs {required} bytes, local capacity is {capacity}")]
    ExceedsCapacity { required: usize, capacity: usize },

    #[error("scratchpad base 0x{0:x} is not 4-byte aligned")]
    MisalignedBase(u64),
}

/// What a scratchpad slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Input,
    Weights,
    Output,
    /// Kappa and lambda arrays of one channel block
    Requant,
}

impl BufferRole {
    pub const ALL: [BufferRole; 4] = [
        BufferRole::Input,
        BufferRole::Weights,
        BufferRole::Output,
        BufferRole::Requant,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BufferRole::Input => "input",
            BufferRole::Weights => "weights",
            BufferRole::Output => "output",
            BufferRole::Requant => "requant",
        }
    }
}

/// Which of the two slots of a role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Parity {
    #[default]
    A,
    B,
}

impl Parity {
    /// The other slot.
    #[inline]
    pub fn flip(self) -> Self {
        match self {
            Parity::A => Parity::B,
            Parity::B => Parity::A,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Parity::A => 0,
            Parity::B => 1,
        }
    }
}

/// Two adjacent slots of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPair {
    pub base: usize,
    pub slot_size: usize,
}

impl SlotPair {
    /// Offset of one slot.
    #[inline]
    pub fn slot(&self, parity: Parity) -> usize {
        self.base + parity.index() * self.slot_size
    }

    /// First byte past the pair.
    #[inline]
    pub fn end(&self) -> usize {
        self.base + 2 * self.slot_size
    }
}

/// Scratchpad partition for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    input: SlotPair,
    output: SlotPair,
    weights: SlotPair,
    requant: SlotPair,
    /// Offset of lambda inside a requant slot
    lambda_offset: usize,
    workspace: Span,
    total: usize,
}

impl ScratchLayout {
    /// Plan the partition from the largest tile of every role.
    pub fn plan(geometry: &LayerGeometry) -> Self {
        let mut cursor = 0;
        let mut pair = |bytes: usize| {
            let slot_size = bytes.next_multiple_of(ALIGN);
            let pair = SlotPair { base: cursor, slot_size };
            cursor = pair.end();
            pair
        };

        let input = pair(geometry.max_input_tile_bytes());
        let output = pair(geometry.max_output_tile_bytes());
        let weights = pair(geometry.max_weight_tile_bytes());
        let requant = pair(geometry.requant_pair_bytes());
        let workspace = Span::new(cursor, geometry.workspace_bytes.next_multiple_of(ALIGN));
        let total = workspace.end();

        let layout = Self {
            input,
            output,
            weights,
            requant,
            lambda_offset: geometry.block.channels * 4,
            workspace,
            total,
        };
        log::debug!(
            "Scratch layout: input={}x2 output={}x2 weights={}x2 requant={}x2 workspace={} total={}",
            input.slot_size, output.slot_size, weights.slot_size, requant.slot_size,
            workspace.len, total
        );
        layout
    }

    /// Slot pair of a role.
    pub fn slots(&self, role: BufferRole) -> SlotPair {
        match role {
            BufferRole::Input => self.input,
            BufferRole::Weights => self.weights,
            BufferRole::Output => self.output,
            BufferRole::Requant => self.requant,
        }
    }

    /// Offset of one slot.
    pub fn slot(&self, role: BufferRole, parity: Parity) -> usize {
        self.slots(role).slot(parity)
    }

    pub fn kappa_offset(&self, parity: Parity) -> usize {
        self.requant.slot(parity)
    }

    pub fn lambda_offset(&self, parity: Parity) -> usize {
        self.requant.slot(parity) + self.lambda_offset
    }

    /// Kernel workspace.
    pub fn workspace(&self) -> Span {
        self.workspace
    }

    /// Bytes the layout occupies.
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Every named region as `(name, offset, size)`.
    pub fn regions(&self) -> Vec<(String, usize, usize)> {
        let mut regions = Vec::with_capacity(9);
        for role in BufferRole::ALL {
            let pair = self.slots(role);
            for parity in [Parity::A, Parity::B] {
                regions.push((
                    format!("{}_{:?}", role.name(), parity).to_lowercase(),
                    pair.slot(parity),
                    pair.slot_size,
                ));
            }
        }
        regions.push(("workspace".to_string(), self.workspace.start, self.workspace.len));
        regions
    }

    /// Check the layout fits in `capacity` bytes.
    pub fn validate(&self, capacity: usize) -> Result<(), LayoutError> {
        if self.total > capacity {
            return Err(LayoutError::ExceedsCapacity { required: self.total, capacity });
        }
        Ok(())
    }

    /// Check the layout fits at `base` in a scratchpad of `capacity` bytes.
    pub fn validate_at(&self, base: u64, capacity: usize) -> Result<(), LayoutError> {
        if base % ALIGN as u64 != 0 {
            return Err(LayoutError::MisalignedBase(base));
        }
        let available = capacity.saturating_sub(base as usize);
        self.validate(available).map_err(|_| LayoutError::ExceedsCapacity {
            required: self.total + base as usize,
            capacity,
        })
    }
}
