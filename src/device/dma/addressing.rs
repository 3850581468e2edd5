//! 3D strided address generation for tile transfers.
//!
//! A tile transfer moves a number of contiguous byte runs. The runs are laid
//! out on the strided (external) side by two outer dimensions:
//!
//! - run: `run_bytes` contiguous bytes (fastest axis)
//! - middle: `middle.size` runs, `middle.stride` bytes apart
//! - outer: `outer.size` planes of middle runs, `outer.stride` bytes apart
//!
//! For an HWC tensor tile this is: run = the channel slice of one pixel,
//! middle = pixels of one row, outer = rows.
//!
//! # Address Generation
//!
//! With base 0x1000, run 4 bytes, middle size=3 stride=16, outer size=2
//! stride=64:
//! ```text
//! Row 0: 0x1000, 0x1010, 0x1020
//! Row 1: 0x1040, 0x1050, 0x1060
//! ```
//!
//! The packed (local) side always stores the runs back to back.

/// Configuration for a single outer dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionConfig {
    /// Number of iterations; 0 is treated as 1
    pub size: u32,

    /// Address increment in bytes after each iteration
    pub stride: i64,
}

impl DimensionConfig {
    /// Create a new dimension config.
    pub fn new(size: u32, stride: i64) -> Self {
        Self { size, stride }
    }

    /// Effective size (0 = 1 iteration).
    #[inline]
    pub fn effective_size(&self) -> u32 {
        if self.size == 0 { 1 } else { self.size }
    }
}

/// Shape of a 3D block transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferShape {
    /// Contiguous bytes per run (fastest axis)
    pub run_bytes: u32,
    /// Middle axis: run count and stride
    pub middle: DimensionConfig,
    /// Outer axis: block count and stride
    pub outer: DimensionConfig,
}

impl TransferShape {
    /// Contiguous 1D transfer of `bytes` bytes.
    pub fn contiguous(bytes: u32) -> Self {
        Self {
            run_bytes: bytes,
            middle: DimensionConfig::new(1, 0),
            outer: DimensionConfig::new(1, 0),
        }
    }

    /// General 3D transfer.
    pub fn new_3d(
        run_bytes: u32,
        middle_size: u32,
        middle_stride: i64,
        outer_size: u32,
        outer_stride: i64,
    ) -> Self {
        Self {
            run_bytes,
            middle: DimensionConfig::new(middle_size, middle_stride),
            outer: DimensionConfig::new(outer_size, outer_stride),
        }
    }

    /// Number of runs in the transfer.
    #[inline]
    pub fn runs(&self) -> u64 {
        self.middle.effective_size() as u64 * self.outer.effective_size() as u64
    }

    /// Bytes moved by one outer block.
    #[inline]
    pub fn block_bytes(&self) -> u64 {
        self.run_bytes as u64 * self.middle.effective_size() as u64
    }

    /// Total bytes moved.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.run_bytes as u64 * self.runs()
    }

    /// Sub-shape covering `count` outer blocks.
    pub fn with_blocks(&self, count: u32) -> Self {
        Self {
            outer: DimensionConfig::new(count, self.outer.stride),
            ..*self
        }
    }
}

/// Generator of run start addresses on the strided side of a transfer.
///
/// The address of run (m, o) is `base + m * middle.stride + o * outer.stride`.
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    base: u64,
    shape: TransferShape,
    /// [middle, outer] counters
    counters: [u32; 2],
    runs_generated: u64,
}

impl AddressGenerator {
    /// Create a generator for a transfer shape.
    pub fn new(base: u64, shape: TransferShape) -> Self {
        Self {
            base,
            shape,
            counters: [0; 2],
            runs_generated: 0,
        }
    }

    fn compute_address(&self) -> u64 {
        let offset = self.counters[0] as i64 * self.shape.middle.stride
            + self.counters[1] as i64 * self.shape.outer.stride;
        (self.base as i64 + offset) as u64
    }

    /// Check if all runs have been generated.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.runs_generated >= self.shape.runs()
    }

    /// Runs remaining.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.shape.runs().saturating_sub(self.runs_generated)
    }

    /// Next run start address, or None when finished.
    pub fn next(&mut self) -> Option<u64> {
        if self.is_finished() {
            return None;
        }

        let addr = self.compute_address();
        self.runs_generated += 1;

        self.counters[0] += 1;
        if self.counters[0] >= self.shape.middle.effective_size() {
            self.counters[0] = 0;
            self.counters[1] += 1;
        }

        Some(addr)
    }

    /// Iterate over all run addresses from the start.
    pub fn iter(&self) -> AddressIterator {
        AddressIterator {
            generator: Self::new(self.base, self.shape),
        }
    }
}

/// Iterator over run start addresses.
pub struct AddressIterator {
    generator: AddressGenerator,
}

impl Iterator for AddressIterator {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        self.generator.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.generator.remaining() as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AddressIterator {}
