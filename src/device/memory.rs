//! Emulated memory tiers of the cluster.
//!
//! Three capacity/latency classes take part in a layer invocation:
//!
//! ```text
//! ┌────────────────────────────┐
//! │  Slow tier (external RAM)  │  whole tensors, parameter blobs
//! └─────────────┬──────────────┘
//!               │ bulk staging
//! ┌─────────────▼──────────────┐
//! │  Mid tier (on-chip L2)     │  staged tensors, tile sources
//! └─────────────┬──────────────┘
//!               │ 3D tile DMA
//! ┌─────────────▼──────────────┐
//! │  Local tier (cluster L1)   │  double-buffered tile slots
//! └────────────────────────────┘
//! ```
//!
//! Each tier is a sparse paged byte store. Pages are allocated on first
//! write and unallocated bytes read as zero, so large address spaces cost
//! nothing until touched.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Memory tier an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryTier {
    /// Bulk external storage.
    Slow,
    /// On-chip staging memory.
    Mid,
    /// Per-cluster scratchpad.
    Local,
}

impl MemoryTier {
    fn index(self) -> usize {
        match self {
            MemoryTier::Slow => 0,
            MemoryTier::Mid => 1,
            MemoryTier::Local => 2,
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::Slow => write!(f, "slow"),
            MemoryTier::Mid => write!(f, "mid"),
            MemoryTier::Local => write!(f, "local"),
        }
    }
}

/// A named address range used for debugging and accounting.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Human-readable name ("input", "weights", "scratch", ...)
    pub name: String,
    /// First byte of the region
    pub base_address: u64,
    /// Size in bytes
    pub size: usize,
    /// Number of DMA reads touching this region
    pub dma_reads: u64,
    /// Number of DMA writes touching this region
    pub dma_writes: u64,
}

impl MemoryRegion {
    /// Create a new region.
    pub fn new(name: impl Into<String>, base_address: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            base_address,
            size,
            dma_reads: 0,
            dma_writes: 0,
        }
    }

    /// End address (exclusive).
    #[inline]
    pub fn end(&self) -> u64 {
        self.base_address.saturating_add(self.size as u64)
    }

    /// Check if an address falls within this region.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.end()
    }

    /// Check if an address range overlaps this region.
    #[inline]
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = addr.saturating_add(len as u64);
        addr < self.end() && end > self.base_address
    }
}

/// Error type for tier memory bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// New region overlaps one already registered
    #[error("{tier} region '{name}' at 0x{base:08x} overlaps '{existing}'")]
    RegionOverlap {
        tier: MemoryTier,
        name: String,
        base: u64,
        existing: String,
    },

    /// Region does not fit the tier's capacity
    #[error("{tier} region '{name}' ends at 0x{end:08x}, past capacity 0x{capacity:08x}")]
    BeyondCapacity {
        tier: MemoryTier,
        name: String,
        end: u64,
        capacity: u64,
    },
}

/// Sparse byte-addressable memory for one tier.
pub struct TierMemory {
    tier: MemoryTier,

    /// Addressable bytes, if the tier is bounded
    capacity: Option<u64>,

    /// page_address -> page_data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,

    regions: Vec<MemoryRegion>,

    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl TierMemory {
    /// Page size for sparse storage.
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    /// Create an unbounded tier.
    pub fn new(tier: MemoryTier) -> Self {
        Self {
            tier,
            capacity: None,
            pages: BTreeMap::new(),
            regions: Vec::new(),
            total_bytes_written: 0,
            total_bytes_read: 0,
        }
    }

    /// Create a tier with a fixed capacity, as the local scratchpad has.
    pub fn with_capacity(tier: MemoryTier, capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(tier)
        }
    }

    /// Which tier this memory models.
    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    /// Capacity in bytes, `None` when unbounded.
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    /// Register a named region.
    ///
    /// Pages are not touched; the region only feeds accounting and the
    /// capacity/overlap checks.
    pub fn allocate_region(
        &mut self,
        name: impl Into<String>,
        base_address: u64,
        size: usize,
    ) -> Result<(), MemoryError> {
        let name = name.into();

        if let Some(capacity) = self.capacity {
            let end = base_address.saturating_add(size as u64);
            if end > capacity {
                return Err(MemoryError::BeyondCapacity {
                    tier: self.tier,
                    name,
                    end,
                    capacity,
                });
            }
        }

        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(base_address, size)) {
            return Err(MemoryError::RegionOverlap {
                tier: self.tier,
                name,
                base: base_address,
                existing: existing.name.clone(),
            });
        }

        self.regions.push(MemoryRegion::new(name, base_address, size));
        Ok(())
    }

    /// Get a region by name.
    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// All registered regions.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Forget every region. Page contents are kept.
    pub fn clear_regions(&mut self) {
        self.regions.clear();
    }

    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages
            .entry(page_addr)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    fn get_page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages.get(&page_addr).map(|b| b.as_ref())
    }

    /// Write a byte slice.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut current_addr = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page = self.get_or_create_page(current_addr);
            let offset = (current_addr & !Self::PAGE_MASK) as usize;
            let to_write = remaining.len().min(Self::PAGE_SIZE - offset);

            page[offset..offset + to_write].copy_from_slice(&remaining[..to_write]);

            current_addr += to_write as u64;
            remaining = &remaining[to_write..];
        }

        self.total_bytes_written += data.len() as u64;
    }

    /// Read bytes into a buffer. Unallocated pages read as zero.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut current_addr = addr;
        let mut filled = 0;

        while filled < buf.len() {
            let page_offset = (current_addr & !Self::PAGE_MASK) as usize;
            let to_read = (buf.len() - filled).min(Self::PAGE_SIZE - page_offset);

            match self.get_page(current_addr) {
                Some(page) => buf[filled..filled + to_read]
                    .copy_from_slice(&page[page_offset..page_offset + to_read]),
                None => buf[filled..filled + to_read].fill(0),
            }

            current_addr += to_read as u64;
            filled += to_read;
        }
    }

    /// Read `len` bytes into a fresh vector.
    pub fn read_vec(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read_bytes(addr, &mut buf);
        buf
    }

    /// Write a single byte.
    #[inline]
    pub fn write_u8(&mut self, addr: u64, value: u8) {
        self.write_bytes(addr, &[value]);
    }

    /// Read a single byte.
    #[inline]
    pub fn read_u8(&self, addr: u64) -> u8 {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf);
        buf[0]
    }

    /// Write a little-endian 32-bit signed word.
    pub fn write_i32(&mut self, addr: u64, value: i32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.write_bytes(addr, &buf);
    }

    /// Read a little-endian 32-bit signed word.
    pub fn read_i32(&self, addr: u64) -> i32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        LittleEndian::read_i32(&buf)
    }

    /// Write an array of little-endian 32-bit signed words.
    pub fn write_i32_slice(&mut self, addr: u64, values: &[i32]) {
        let mut buf = vec![0u8; values.len() * 4];
        LittleEndian::write_i32_into(values, &mut buf);
        self.write_bytes(addr, &buf);
    }

    /// Read `count` little-endian 32-bit signed words.
    pub fn read_i32_vec(&self, addr: u64, count: usize) -> Vec<i32> {
        let buf = self.read_vec(addr, count * 4);
        let mut values = vec![0i32; count];
        LittleEndian::read_i32_into(&buf, &mut values);
        values
    }

    /// Record a DMA read against the region it touches.
    pub fn record_dma_read(&mut self, addr: u64, len: usize) {
        self.total_bytes_read += len as u64;
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.dma_reads += 1;
        }
    }

    /// Record a DMA write against the region it touches.
    pub fn record_dma_write(&mut self, addr: u64, len: usize) {
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.dma_writes += 1;
        }
    }

    /// Total bytes written, by any agent.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Total bytes read by DMA.
    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Number of allocated pages.
    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }
}

impl std::fmt::Debug for TierMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierMemory")
            .field("tier", &self.tier)
            .field("capacity", &self.capacity)
            .field("allocated_pages", &self.pages.len())
            .field("regions", &self.regions.len())
            .field("total_bytes_written", &self.total_bytes_written)
            .finish()
    }
}

/// The three tiers shared by every unit in the cluster.
///
/// Each tier sits behind its own lock. The DMA engine locks source and
/// destination one after the other, never both at once.
#[derive(Debug)]
pub struct MemorySystem {
    tiers: [Mutex<TierMemory>; 3],
}

impl MemorySystem {
    /// Create a memory system with an unbounded slow and mid tier and a
    /// local tier of `local_capacity` bytes.
    pub fn new(local_capacity: u64) -> Self {
        Self {
            tiers: [
                Mutex::new(TierMemory::new(MemoryTier::Slow)),
                Mutex::new(TierMemory::new(MemoryTier::Mid)),
                Mutex::new(TierMemory::with_capacity(MemoryTier::Local, local_capacity)),
            ],
        }
    }

    /// Lock one tier.
    pub fn lock(&self, tier: MemoryTier) -> MutexGuard<'_, TierMemory> {
        self.tiers[tier.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_read_write() {
        let mut mem = TierMemory::new(MemoryTier::Mid);

        mem.write_u8(0x1000, 0xAB);
        assert_eq!(mem.read_u8(0x1000), 0xAB);

        mem.write_i32(0x2000, -123_456);
        assert_eq!(mem.read_i32(0x2000), -123_456);
    }

    #[test]
    fn test_unallocated_reads_zero() {
        let mem = TierMemory::new(MemoryTier::Slow);
        assert_eq!(mem.read_u8(0x9999_0000), 0);
        assert_eq!(mem.read_vec(0x9999_0000, 8), vec![0; 8]);
    }

    #[test]
    fn test_cross_page_write() {
        let mut mem = TierMemory::new(MemoryTier::Mid);

        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE];
        mem.write_bytes(4094, &data);

        assert_eq!(mem.read_vec(4094, 6), data);
        assert_eq!(mem.allocated_pages(), 2);
    }

    #[test]
    fn test_i32_slice_round_trip_is_little_endian() {
        let mut mem = TierMemory::new(MemoryTier::Local);
        mem.write_i32_slice(0x40, &[1, -1, 0x0102_0304]);

        assert_eq!(mem.read_vec(0x40, 4), vec![1, 0, 0, 0]);
        assert_eq!(mem.read_vec(0x48, 4), vec![4, 3, 2, 1]);
        assert_eq!(mem.read_i32_vec(0x40, 3), vec![1, -1, 0x0102_0304]);
    }

    #[test]
    fn test_region_overlap_detection() {
        let mut mem = TierMemory::new(MemoryTier::Mid);
        mem.allocate_region("first", 0x1000, 4096).unwrap();

        let result = mem.allocate_region("second", 0x1800, 4096);
        assert!(matches!(result, Err(MemoryError::RegionOverlap { .. })));

        mem.allocate_region("third", 0x2000, 4096).unwrap();
        assert_eq!(mem.regions().len(), 2);

        mem.write_u8(0x1000, 7);
        mem.clear_regions();
        assert!(mem.regions().is_empty());
        assert_eq!(mem.read_u8(0x1000), 7);
        mem.allocate_region("second", 0x1800, 4096).unwrap();
    }

    #[test]
    fn test_region_beyond_capacity() {
        let mut mem = TierMemory::with_capacity(MemoryTier::Local, 1024);
        mem.allocate_region("fits", 0, 1024).unwrap();

        let result = mem.allocate_region("spills", 1024, 1);
        assert!(matches!(result, Err(MemoryError::BeyondCapacity { end: 1025, .. })));
    }

    #[test]
    fn test_region_overlaps() {
        let region = MemoryRegion::new("test", 0x1000, 256);

        assert!(region.overlaps(0x1050, 16));
        assert!(region.overlaps(0x0F80, 256));
        assert!(region.overlaps(0x1080, 256));
        assert!(!region.overlaps(0x0F00, 256));
        assert!(!region.overlaps(0x1100, 16));
    }

    #[test]
    fn test_dma_accounting() {
        let mut mem = TierMemory::new(MemoryTier::Mid);
        mem.allocate_region("input", 0x1000, 256).unwrap();

        mem.record_dma_read(0x1010, 32);
        mem.record_dma_read(0x1040, 32);
        mem.record_dma_write(0x1000, 4);

        let region = mem.region("input").unwrap();
        assert_eq!(region.dma_reads, 2);
        assert_eq!(region.dma_writes, 1);
        assert_eq!(mem.total_bytes_read(), 64);
    }

    #[test]
    fn test_memory_system_tiers_are_independent() {
        let system = MemorySystem::new(64 * 1024);
        system.lock(MemoryTier::Slow).write_u8(0x10, 1);
        system.lock(MemoryTier::Mid).write_u8(0x10, 2);

        assert_eq!(system.lock(MemoryTier::Slow).read_u8(0x10), 1);
        assert_eq!(system.lock(MemoryTier::Mid).read_u8(0x10), 2);
        assert_eq!(system.lock(MemoryTier::Local).read_u8(0x10), 0);
        assert_eq!(system.lock(MemoryTier::Local).capacity(), Some(64 * 1024));
    }
}
