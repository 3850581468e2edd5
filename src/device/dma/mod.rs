//! DMA transfer subsystem.
//!
//! Models the cluster DMA: 3D strided block transfers between a strided
//! external endpoint and a packed local endpoint, queued in hardware FIFO
//! order and retired on wait.
//!
//! # Transfer Layout
//!
//! ```text
//!   external (strided)                    local (packed)
//!  ┌──────────────────────┐              ┌──────────────┐
//!  │ run ░░ run ░░ run ░░ │ ── row 0 ──► │ run run run  │
//!  │ run ░░ run ░░ run ░░ │ ── row 1 ──► │ run run run  │
//!  └──────────────────────┘              └──────────────┘
//! ```
//!
//! `ExtToLoc` gathers runs into the packed buffer, `LocToExt` scatters a
//! packed buffer back into the strided layout.
//!
//! # Usage
//!
//! ```ignore
//! use cluster_tiler::device::dma::{DmaEngine, TransferDescriptor, TransferKind, TransferShape};
//!
//! let engine = DmaEngine::new(memory.clone(), 16);
//! let handle = engine.submit(TransferDescriptor::inbound(
//!     TransferKind::Input,
//!     Endpoint::new(MemoryTier::Mid, 0x1000),
//!     Endpoint::new(MemoryTier::Local, 0x0),
//!     TransferShape::new_3d(32, 16, 256, 16, 4096),
//! ));
//! // ... compute on another buffer ...
//! engine.wait(handle);
//! ```

pub mod addressing;
pub mod engine;

pub use addressing::{AddressGenerator, AddressIterator, DimensionConfig, TransferShape};
pub use engine::{DmaEngine, DmaStats, KindStats, TransferHandle, DEFAULT_QUEUE_DEPTH};

use crate::device::memory::MemoryTier;

/// One end of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub tier: MemoryTier,
    pub addr: u64,
}

impl Endpoint {
    pub fn new(tier: MemoryTier, addr: u64) -> Self {
        Self { tier, addr }
    }

    /// Endpoint displaced by `delta` bytes.
    pub fn offset(&self, delta: i64) -> Self {
        Self {
            tier: self.tier,
            addr: (self.addr as i64 + delta) as u64,
        }
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Gather from the strided side into the packed side
    ExtToLoc,
    /// Scatter from the packed side into the strided side
    LocToExt,
}

/// What a transfer carries, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Input activation tile
    Input,
    /// Weight tile
    Weights,
    /// Requantization multiplier/bias arrays
    Requant,
    /// Output activation tile
    Output,
    /// Bulk slow <-> mid staging
    Staging,
}

impl TransferKind {
    pub(crate) fn index(self) -> usize {
        match self {
            TransferKind::Input => 0,
            TransferKind::Weights => 1,
            TransferKind::Requant => 2,
            TransferKind::Output => 3,
            TransferKind::Staging => 4,
        }
    }
}

/// A 3D block transfer between two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Strided endpoint
    pub ext: Endpoint,
    /// Packed endpoint
    pub loc: Endpoint,
    /// Shape on the strided side
    pub shape: TransferShape,
    pub direction: TransferDirection,
    pub kind: TransferKind,
}

impl TransferDescriptor {
    /// Transfer gathering `ext` into `loc`.
    pub fn inbound(kind: TransferKind, ext: Endpoint, loc: Endpoint, shape: TransferShape) -> Self {
        Self { ext, loc, shape, direction: TransferDirection::ExtToLoc, kind }
    }

    /// Transfer scattering `loc` back into `ext`.
    pub fn outbound(
        kind: TransferKind,
        ext: Endpoint,
        loc: Endpoint,
        shape: TransferShape,
    ) -> Self {
        Self { ext, loc, shape, direction: TransferDirection::LocToExt, kind }
    }

    /// Bytes moved.
    pub fn total_bytes(&self) -> u64 {
        self.shape.total_bytes()
    }

    /// Endpoint written by this transfer.
    pub fn destination(&self) -> Endpoint {
        match self.direction {
            TransferDirection::ExtToLoc => self.loc,
            TransferDirection::LocToExt => self.ext,
        }
    }

    /// Byte range `[start, end)` the transfer writes, in its destination tier.
    ///
    /// For a strided destination this is the bounding range of all runs.
    pub fn destination_span(&self) -> (u64, u64) {
        match self.direction {
            TransferDirection::ExtToLoc => (self.loc.addr, self.loc.addr + self.total_bytes()),
            TransferDirection::LocToExt => {
                let gen = AddressGenerator::new(self.ext.addr, self.shape);
                let mut lo = u64::MAX;
                let mut hi = 0;
                for addr in gen.iter() {
                    lo = lo.min(addr);
                    hi = hi.max(addr + self.shape.run_bytes as u64);
                }
                if lo > hi { (self.ext.addr, self.ext.addr) } else { (lo, hi) }
            }
        }
    }

    /// Share of this transfer issued by unit `part` of `parts`.
    ///
    /// Outer blocks are divided in contiguous chunks of `ceil(blocks / parts)`.
    /// Units past the last chunk get `None`. The union of all shares is the
    /// whole transfer, with no block moved twice.
    pub fn split(&self, part: usize, parts: usize) -> Option<Self> {
        let blocks = self.shape.outer.effective_size() as usize;
        let parts = parts.max(1);
        let chunk = blocks.div_ceil(parts);
        let start = part * chunk;
        if start >= blocks {
            return None;
        }
        let count = chunk.min(blocks - start);

        let ext_delta = start as i64 * self.shape.outer.stride;
        let loc_delta = start as i64 * self.shape.block_bytes() as i64;
        Some(Self {
            ext: self.ext.offset(ext_delta),
            loc: self.loc.offset(loc_delta),
            shape: self.shape.with_blocks(count as u32),
            ..*self
        })
    }
}
