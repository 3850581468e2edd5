//! Compute kernel contract.
//!
//! The tile loop never looks inside the kernel. Every unit of the team calls
//! [`ComputeKernel::invoke`] with the same [`KernelCall`]; splitting the work
//! between units is up to the kernel.

pub mod depthwise;

pub use depthwise::DepthwiseBnRelu;

use crate::cluster::UnitId;
use crate::device::MemorySystem;
use crate::layer::{Padding, PaddingFlags, RequantParams, TileDims};

/// Local-tier addresses and extents of one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCall {
    /// Packed HWC input tile
    pub input: u64,
    pub input_dims: TileDims,
    /// `[C][K][K]` int8 weight tile
    pub weights: u64,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    /// Sides of the tile on the tensor boundary
    pub padding_flags: PaddingFlags,
    /// Padding amounts, applied on flagged sides only
    pub padding: Padding,
    pub workspace: u64,
    pub workspace_bytes: usize,
    /// int32 multipliers, one per output channel
    pub kappa: u64,
    /// int32 biases, one per output channel
    pub lambda: u64,
    pub requant: RequantParams,
    /// Packed HWC output tile
    pub output: u64,
    pub output_dims: TileDims,
}

impl KernelCall {
    /// Byte ranges `(addr, len)` compute reads.
    pub fn read_ranges(&self) -> [(u64, u64); 4] {
        let requant_bytes = self.out_channels as u64 * 4;
        [
            (self.input, self.input_dims.bytes() as u64),
            (self.weights, (self.out_channels * self.kernel_size * self.kernel_size) as u64),
            (self.kappa, requant_bytes),
            (self.lambda, requant_bytes),
        ]
    }

    /// Byte range compute writes.
    pub fn write_range(&self) -> (u64, u64) {
        (self.output, self.output_dims.bytes() as u64)
    }
}

/// A depthwise convolution with fused requantization.
pub trait ComputeKernel: Sync {
    /// Compute one output tile in place in the local tier.
    fn invoke(&self, unit: UnitId, call: &KernelCall, memory: &MemorySystem);

    /// Short name for logs.
    fn name(&self) -> &str {
        "kernel"
    }
}
