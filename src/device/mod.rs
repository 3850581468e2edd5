//! Device models for the accelerator cluster.
//!
//! This module provides:
//! - The three memory tiers (slow, mid, local) as sparse byte stores
//! - The cluster DMA engine moving 3D tiles between tiers
//!
//! # Architecture Overview
//!
//! ```text
//!  ┌──────────────┐     ┌──────────────┐
//!  │  Slow tier   │◄───►│   Mid tier   │   staging (bulk, 1D)
//!  └──────────────┘     └──────┬───────┘
//!                              │ 3D tile DMA (FIFO queue)
//!          ┌───────────────────▼────────────────────┐
//!          │            Local scratchpad            │
//!          │  unit 0   unit 1   ...   unit N-1      │
//!          └────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cluster_tiler::device::{MemorySystem, MemoryTier};
//! use cluster_tiler::device::dma::{DmaEngine, Endpoint, TransferDescriptor, TransferKind, TransferShape};
//!
//! let memory = Arc::new(MemorySystem::new(64 * 1024));
//! memory.lock(MemoryTier::Mid).write_bytes(0x1000, &[1, 2, 3, 4]);
//!
//! let dma = DmaEngine::new(memory.clone(), 16);
//! dma.submit_and_wait(TransferDescriptor::inbound(
//!     TransferKind::Staging,
//!     Endpoint::new(MemoryTier::Mid, 0x1000),
//!     Endpoint::new(MemoryTier::Local, 0x0),
//!     TransferShape::contiguous(4),
//! ));
//! assert_eq!(memory.lock(MemoryTier::Local).read_vec(0, 4), vec![1, 2, 3, 4]);
//! ```

pub mod memory;
pub mod dma;

pub use memory::{MemoryError, MemoryRegion, MemorySystem, MemoryTier, TierMemory};
pub use dma::{
    DmaEngine, DmaStats, Endpoint, TransferDescriptor, TransferDirection, TransferHandle,
    TransferKind, TransferShape,
};
