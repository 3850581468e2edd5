//! Cluster DMA engine.
//!
//! The engine is shared by every unit of the cluster. Submitted transfers
//! enter a hardware-style FIFO of `queue_depth` entries and retire strictly
//! in submission order. A transfer moves its data when it retires, so a
//! buffer targeted by a queued transfer still holds its old contents until
//! someone waits past it.
//!
//! # Queue Model
//!
//! ```text
//!  submit ──► [ t5 | t6 | t7 ] ──► retire (copy data) ──► done
//!               ▲ head            queue_depth entries
//! ```
//!
//! - `submit` on a full queue retires the head first (the submitter stalls
//!   until a slot frees).
//! - `wait(h)` retires every transfer up to and including `h`.
//! - Failures are outside the model: every queued transfer completes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::addressing::AddressGenerator;
use super::{TransferDescriptor, TransferDirection, TransferKind};
use crate::device::memory::{MemorySystem, MemoryTier};

/// Outstanding transfers the cluster DMA accepts before stalling.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Completion handle for a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferHandle {
    id: u64,
}

impl TransferHandle {
    /// Sequence number of the transfer.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Counters for one transfer kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Transfers retired
    pub transfers: u64,
    /// Bytes moved
    pub bytes: u64,
}

/// Engine-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmaStats {
    per_kind: [KindStats; 5],
    /// Highest number of transfers queued at once
    pub max_in_flight: usize,
    /// Submissions that found the queue full
    pub queue_stalls: u64,
}

impl DmaStats {
    /// Counters for one kind.
    pub fn kind(&self, kind: TransferKind) -> KindStats {
        self.per_kind[kind.index()]
    }

    /// Transfers retired across all kinds.
    pub fn total_transfers(&self) -> u64 {
        self.per_kind.iter().map(|k| k.transfers).sum()
    }

    /// Bytes moved across all kinds.
    pub fn total_bytes(&self) -> u64 {
        self.per_kind.iter().map(|k| k.bytes).sum()
    }

    fn record(&mut self, kind: TransferKind, bytes: u64) {
        let entry = &mut self.per_kind[kind.index()];
        entry.transfers += 1;
        entry.bytes += bytes;
    }
}

#[derive(Debug, Default)]
struct EngineState {
    /// Id given to the next submission
    next_id: u64,
    /// Every id below this has retired
    retired: u64,
    queue: VecDeque<(u64, TransferDescriptor)>,
    stats: DmaStats,
}

/// DMA engine shared by the units of a cluster.
#[derive(Debug)]
pub struct DmaEngine {
    memory: Arc<MemorySystem>,
    queue_depth: usize,
    state: Mutex<EngineState>,
}

impl DmaEngine {
    /// Create an engine over `memory` accepting `queue_depth` outstanding
    /// transfers (at least one).
    pub fn new(memory: Arc<MemorySystem>, queue_depth: usize) -> Self {
        let queue_depth = queue_depth.max(1);
        log::debug!("DmaEngine::new queue_depth={}", queue_depth);
        Self {
            memory,
            queue_depth,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Memory the engine moves data in.
    pub fn memory(&self) -> &Arc<MemorySystem> {
        &self.memory
    }

    /// Configured queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a transfer without waiting for it.
    pub fn submit(&self, desc: TransferDescriptor) -> TransferHandle {
        let mut state = self.lock_state();

        if state.queue.len() >= self.queue_depth {
            state.stats.queue_stalls += 1;
            while state.queue.len() >= self.queue_depth {
                self.retire_head(&mut state);
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        log::trace!(
            "dma submit #{} {:?} {:?} ext={}:0x{:x} loc={}:0x{:x} bytes={}",
            id, desc.kind, desc.direction, desc.ext.tier, desc.ext.addr,
            desc.loc.tier, desc.loc.addr, desc.total_bytes()
        );
        state.queue.push_back((id, desc));
        state.stats.max_in_flight = state.stats.max_in_flight.max(state.queue.len());

        TransferHandle { id }
    }

    /// Block until the transfer behind `handle` has completed.
    pub fn wait(&self, handle: TransferHandle) {
        let mut state = self.lock_state();
        while state.retired <= handle.id {
            if state.queue.is_empty() {
                // Handle from another engine; nothing of ours can satisfy it.
                log::warn!("dma wait on unknown handle #{}", handle.id);
                return;
            }
            self.retire_head(&mut state);
        }
    }

    /// Submit a transfer and wait for it.
    pub fn submit_and_wait(&self, desc: TransferDescriptor) {
        let handle = self.submit(desc);
        self.wait(handle);
    }

    /// Check whether a transfer has completed.
    pub fn is_complete(&self, handle: TransferHandle) -> bool {
        self.lock_state().retired > handle.id
    }

    /// Transfers currently queued.
    pub fn in_flight(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Whether a queued transfer writes into `[addr, addr + len)` of `tier`.
    pub fn pending_writes_into(&self, tier: MemoryTier, addr: u64, len: u64) -> bool {
        let end = addr + len;
        self.lock_state().queue.iter().any(|(_, desc)| {
            if desc.destination().tier != tier {
                return false;
            }
            let (lo, hi) = desc.destination_span();
            lo < end && hi > addr
        })
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> DmaStats {
        self.lock_state().stats.clone()
    }

    /// Retire every queued transfer.
    pub fn drain(&self) {
        let mut state = self.lock_state();
        while !state.queue.is_empty() {
            self.retire_head(&mut state);
        }
    }

    fn retire_head(&self, state: &mut EngineState) {
        if let Some((id, desc)) = state.queue.pop_front() {
            self.execute(&desc);
            state.retired = id + 1;
            state.stats.record(desc.kind, desc.total_bytes());
        }
    }

    /// Move the data of one transfer.
    fn execute(&self, desc: &TransferDescriptor) {
        let run = desc.shape.run_bytes as usize;
        let total = desc.total_bytes() as usize;
        let runs = AddressGenerator::new(desc.ext.addr, desc.shape);

        match desc.direction {
            TransferDirection::ExtToLoc => {
                let mut packed = vec![0u8; total];
                {
                    let mut ext = self.memory.lock(desc.ext.tier);
                    for (i, addr) in runs.iter().enumerate() {
                        ext.read_bytes(addr, &mut packed[i * run..(i + 1) * run]);
                    }
                    ext.record_dma_read(desc.ext.addr, total);
                }
                let mut loc = self.memory.lock(desc.loc.tier);
                loc.write_bytes(desc.loc.addr, &packed);
                loc.record_dma_write(desc.loc.addr, total);
            }
            TransferDirection::LocToExt => {
                let packed = {
                    let mut loc = self.memory.lock(desc.loc.tier);
                    loc.record_dma_read(desc.loc.addr, total);
                    loc.read_vec(desc.loc.addr, total)
                };
                let mut ext = self.memory.lock(desc.ext.tier);
                for (i, addr) in runs.iter().enumerate() {
                    ext.write_bytes(addr, &packed[i * run..(i + 1) * run]);
                }
                ext.record_dma_write(desc.ext.addr, total);
            }
        }
    }
}
