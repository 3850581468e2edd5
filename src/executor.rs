//! Layer executor: runs one depthwise layer across the unit team.
//!
//! Every unit runs [`LayerExecutor::run`]'s body with its own loop
//! controller; the plans they follow are identical, so the only shared
//! state is memory, the DMA queue and the barrier.
//!
//! # Per-iteration protocol
//!
//! ```text
//! every unit:  submit own share of input prefetch (tile i+1)
//! leader:      submit weight tile + requant pair if the channel block changes
//! every unit:  wait own handles from iteration i-1        (tile i landed)
//! ─── barrier ───
//! every unit:  kernel(tile i)
//! ─── barrier ───
//! every unit:  write back own share of output tile i
//! ```
//!
//! Before the loop the prologue loads tile 0, weight tile 0 and requant
//! pair 0 synchronously. With an external slow tier the leader stages the
//! input and weights into mid memory first and the output back afterwards.
//!
//! Every scratch slot is registered as a named region of the local tier
//! before the team starts, so a tier too small for the layout is an error
//! and DMA traffic is counted per slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

use crate::cluster::{run_team, BarrierStats, TeamBarrier, UnitId};
use crate::config::{Config, EngineConfig, WritebackPolicy};
use crate::device::dma::{
    DmaEngine, DmaStats, Endpoint, TransferDescriptor, TransferHandle, TransferKind, TransferShape,
};
use crate::device::{MemoryError, MemorySystem, MemoryTier};
use crate::kernel::{ComputeKernel, KernelCall};
use crate::layer::{
    BufferRole, GeometryError, LayerGeometry, LayoutError, ParamBlock, ParamBlockError, Parity,
    ScratchLayout, TileAddressing, TileCoord, WeightBlobLayout,
};
use crate::schedule::{IterationPlan, TileLoopController};

/// Error detected before the team starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("invalid layer geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error("scratchpad does not fit: {0}")]
    Layout(#[from] LayoutError),

    #[error("invalid parameter block: {0}")]
    Params(#[from] ParamBlockError),

    #[error("local memory rejected the scratchpad: {0}")]
    Memory(#[from] MemoryError),
}

/// Outcome of one layer run.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerReport {
    pub iterations: usize,
    /// Input tiles prefetched during the loop
    pub prefetches: usize,
    /// Weight tiles loaded during the loop (prologue excluded)
    pub weight_reloads: usize,
    /// Output tiles written back
    pub write_backs: usize,
    /// Whether slow-tier staging ran
    pub staged: bool,
    pub dma: DmaStats,
    pub barrier: BarrierStats,
    /// Compute started while a transfer into its buffers was still queued
    pub hazards: u64,
}

/// What one unit counted.
#[derive(Debug, Clone, Copy, Default)]
struct UnitTally {
    iterations: usize,
    prefetches: usize,
    weight_reloads: usize,
    write_backs: usize,
}

/// State shared by the team for one run.
struct TeamContext<'a> {
    dma: &'a DmaEngine,
    barrier: &'a TeamBarrier,
    hazards: &'a AtomicU64,
}

/// Executes one layer invocation.
pub struct LayerExecutor<'k> {
    geometry: LayerGeometry,
    params: ParamBlock,
    config: EngineConfig,
    kernel: &'k dyn ComputeKernel,
    layout: ScratchLayout,
    tiles: TileAddressing,
    blob: WeightBlobLayout,
}

impl<'k> LayerExecutor<'k> {
    /// Validate everything up front. After this returns `Ok`, `run` only
    /// fails when the memory it is handed cannot hold the scratchpad.
    pub fn new(
        geometry: LayerGeometry,
        params: ParamBlock,
        config: EngineConfig,
        kernel: &'k dyn ComputeKernel,
    ) -> Result<Self, ExecutorError> {
        geometry.validate()?;

        let layout = ScratchLayout::plan(&geometry);
        layout.validate_at(params.local_base as u64, config.local_capacity)?;

        let tiles = TileAddressing::new(
            &geometry,
            Endpoint::new(MemoryTier::Mid, params.mid_input as u64),
            Endpoint::new(MemoryTier::Mid, params.mid_output as u64),
            Endpoint::new(MemoryTier::Mid, params.mid_weights as u64),
        );
        let blob = WeightBlobLayout::for_geometry(&geometry);

        log::debug!(
            "LayerExecutor::new grid={:?} units={} scratch={}B kernel={}",
            geometry.grid(),
            config.units,
            layout.total_size(),
            kernel.name()
        );

        Ok(Self { geometry, params, config, kernel, layout, tiles, blob })
    }

    /// Build with the engine settings from the cached [`Config`].
    pub fn with_config(
        geometry: LayerGeometry,
        params: ParamBlock,
        kernel: &'k dyn ComputeKernel,
    ) -> Result<Self, ExecutorError> {
        Self::new(geometry, params, Config::get().engine(), kernel)
    }

    /// Build from a raw parameter block.
    pub fn from_words(
        geometry: LayerGeometry,
        words: &[u32],
        config: EngineConfig,
        kernel: &'k dyn ComputeKernel,
    ) -> Result<Self, ExecutorError> {
        let params = ParamBlock::from_words(words)?;
        Self::new(geometry, params, config, kernel)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn geometry(&self) -> &LayerGeometry {
        &self.geometry
    }

    pub fn layout(&self) -> &ScratchLayout {
        &self.layout
    }

    pub fn addressing(&self) -> &TileAddressing {
        &self.tiles
    }

    /// Run the layer on `memory` with a fresh DMA engine and team.
    pub fn run(&self, memory: &Arc<MemorySystem>) -> Result<LayerReport, ExecutorError> {
        self.reserve_scratch(memory)?;

        let dma = DmaEngine::new(Arc::clone(memory), self.config.queue_depth);
        let barrier = TeamBarrier::new(self.config.units);
        let hazards = AtomicU64::new(0);
        let team = TeamContext { dma: &dma, barrier: &barrier, hazards: &hazards };

        let tallies = run_team(self.config.units, |unit| self.run_unit(unit, &team));
        dma.drain();

        let leader = tallies.first().copied().unwrap_or_default();
        let report = LayerReport {
            iterations: leader.iterations,
            prefetches: leader.prefetches,
            weight_reloads: leader.weight_reloads,
            write_backs: leader.write_backs,
            staged: self.params.slow_is_external,
            dma: dma.stats(),
            barrier: barrier.stats(),
            hazards: hazards.load(Ordering::Relaxed),
        };
        log::info!(
            "Layer done: {} tiles, {} prefetches, {} weight reloads, {} DMA bytes, {} hazards",
            report.iterations,
            report.prefetches,
            report.weight_reloads,
            report.dma.total_bytes(),
            report.hazards
        );
        Ok(report)
    }

    /// Register every scratch slot as a region of the local tier.
    ///
    /// Regions left by an earlier run are dropped first; the layer owns the
    /// whole local tier while it runs.
    fn reserve_scratch(&self, memory: &MemorySystem) -> Result<(), MemoryError> {
        let base = self.params.local_base as u64;
        let mut local = memory.lock(MemoryTier::Local);
        local.clear_regions();
        for (name, offset, size) in self.layout.regions() {
            local.allocate_region(name, base + offset as u64, size)?;
        }
        log::debug!(
            "Reserved {} scratch regions at local 0x{:x} (tier capacity {:?})",
            local.regions().len(),
            base,
            local.capacity()
        );
        Ok(())
    }

    fn run_unit(&self, unit: UnitId, team: &TeamContext<'_>) -> UnitTally {
        let mut tally = UnitTally::default();
        let controller = TileLoopController::new(self.geometry.grid());

        if self.params.slow_is_external {
            if unit.is_leader() {
                self.stage_in(team.dma);
            }
            team.barrier.wait();
        }

        self.prologue(unit, team.dma);
        team.barrier.wait();

        let mut inflight: SmallVec<[TransferHandle; 4]> = SmallVec::new();
        let mut writeback: Option<TransferHandle> = None;

        for plan in controller {
            log::trace!(
                "{} iter {} exec {} load {:?}",
                unit,
                plan.index,
                plan.exec,
                plan.load.map(|c| c.to_string())
            );

            let landed = std::mem::take(&mut inflight);
            if let Some(load) = plan.load {
                inflight.extend(self.prefetch(unit, team.dma, &plan, load));
                tally.prefetches += 1;
                if plan.reload_weights {
                    tally.weight_reloads += 1;
                }
            }
            for handle in landed {
                team.dma.wait(handle);
            }

            let call = self.kernel_call(&plan);
            team.barrier.wait();

            if unit.is_leader() {
                self.check_hazards(team, &plan, &call);
            }
            self.kernel.invoke(unit, &call, team.dma.memory());
            team.barrier.wait();

            let share = self
                .output_transfer(plan.exec, plan.slots.output)
                .split(unit.index, unit.team_size);
            match self.config.writeback {
                WritebackPolicy::Blocking => {
                    if let Some(desc) = share {
                        team.dma.submit_and_wait(desc);
                    }
                }
                WritebackPolicy::Deferred => {
                    if let Some(previous) = writeback.take() {
                        team.dma.wait(previous);
                    }
                    writeback = share.map(|desc| team.dma.submit(desc));
                }
            }
            tally.write_backs += 1;
            tally.iterations += 1;
        }

        if let Some(last) = writeback {
            team.dma.wait(last);
        }

        if self.params.slow_is_external {
            team.barrier.wait();
            if unit.is_leader() {
                self.stage_out(team.dma);
            }
        }
        tally
    }

    fn local(&self, offset: usize) -> Endpoint {
        Endpoint::new(MemoryTier::Local, self.params.local_base as u64 + offset as u64)
    }

    /// Synchronous load of input tile 0, weight tile 0 and requant pair 0.
    fn prologue(&self, unit: UnitId, dma: &DmaEngine) {
        let first = TileCoord::ORIGIN;
        if unit.is_leader() {
            log::debug!("Prologue: loading channel block 0 weights and requant pair");
            let handles = self
                .weight_transfers(first.out_channel, Parity::A)
                .map(|desc| dma.submit(desc));
            for handle in handles {
                dma.wait(handle);
            }
        }
        let share = self
            .input_transfer(first, Parity::A)
            .split(unit.index, unit.team_size);
        if let Some(desc) = share {
            dma.submit_and_wait(desc);
        }
    }

    /// Issue this unit's part of the prefetch for `load`.
    fn prefetch(
        &self,
        unit: UnitId,
        dma: &DmaEngine,
        plan: &IterationPlan,
        load: TileCoord,
    ) -> SmallVec<[TransferHandle; 4]> {
        let mut handles = SmallVec::new();

        let share = self
            .input_transfer(load, plan.slots.input.load)
            .split(unit.index, unit.team_size);
        if let Some(desc) = share {
            handles.push(dma.submit(desc));
        }
        if plan.reload_weights && unit.is_leader() {
            log::debug!(
                "Reloading weights for channel block {} into slot {:?}",
                load.out_channel,
                plan.slots.weights.load
            );
            for desc in self.weight_transfers(load.out_channel, plan.slots.weights.load) {
                handles.push(dma.submit(desc));
            }
        }
        handles
    }

    fn input_transfer(&self, coord: TileCoord, slot: Parity) -> TransferDescriptor {
        let tile = self.tiles.input_tile(coord);
        TransferDescriptor::inbound(
            TransferKind::Input,
            tile.ext,
            self.local(self.layout.slot(BufferRole::Input, slot)),
            tile.shape,
        )
    }

    fn output_transfer(&self, coord: TileCoord, slot: Parity) -> TransferDescriptor {
        let tile = self.tiles.output_tile(coord);
        TransferDescriptor::outbound(
            TransferKind::Output,
            tile.ext,
            self.local(self.layout.slot(BufferRole::Output, slot)),
            tile.shape,
        )
    }

    /// Weight tile, kappa and lambda of one channel block.
    fn weight_transfers(&self, block: usize, slot: Parity) -> [TransferDescriptor; 3] {
        let weights = self.tiles.weight_tile(block);
        let kappa = self.tiles.kappa_tile(block);
        let lambda = self.tiles.lambda_tile(block);
        [
            TransferDescriptor::inbound(
                TransferKind::Weights,
                weights.ext,
                self.local(self.layout.slot(BufferRole::Weights, slot)),
                weights.shape,
            ),
            TransferDescriptor::inbound(
                TransferKind::Requant,
                kappa.ext,
                self.local(self.layout.kappa_offset(slot)),
                kappa.shape,
            ),
            TransferDescriptor::inbound(
                TransferKind::Requant,
                lambda.ext,
                self.local(self.layout.lambda_offset(slot)),
                lambda.shape,
            ),
        ]
    }

    fn kernel_call(&self, plan: &IterationPlan) -> KernelCall {
        let input = self.tiles.input_tile(plan.exec);
        let output = self.tiles.output_tile(plan.exec);
        let weights = plan.slots.weights.exec;
        let workspace = self.layout.workspace();

        KernelCall {
            input: self.local(self.layout.slot(BufferRole::Input, plan.slots.input.exec)).addr,
            input_dims: input.dims,
            weights: self.local(self.layout.slot(BufferRole::Weights, weights)).addr,
            out_channels: output.dims.channels,
            kernel_size: self.geometry.kernel,
            stride: self.geometry.stride,
            padding_flags: plan.padding,
            padding: self.geometry.padding,
            workspace: self.local(workspace.start).addr,
            workspace_bytes: workspace.len,
            kappa: self.local(self.layout.kappa_offset(weights)).addr,
            lambda: self.local(self.layout.lambda_offset(weights)).addr,
            requant: self.params.requant(),
            output: self.local(self.layout.slot(BufferRole::Output, plan.slots.output)).addr,
            output_dims: output.dims,
        }
    }

    /// Count queued transfers that still write into buffers compute uses.
    fn check_hazards(&self, team: &TeamContext<'_>, plan: &IterationPlan, call: &KernelCall) {
        let ranges = call.read_ranges().into_iter().chain(std::iter::once(call.write_range()));
        for (addr, len) in ranges {
            if team.dma.pending_writes_into(MemoryTier::Local, addr, len) {
                log::warn!(
                    "iteration {}: transfer in flight into local 0x{:x}+{}",
                    plan.index,
                    addr,
                    len
                );
                team.hazards.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Copy the input tensor and weight blob from slow to mid memory.
    fn stage_in(&self, dma: &DmaEngine) {
        let input_bytes = self.tiles.input_tensor().bytes();
        log::debug!(
            "Staging {} input bytes and {} weight bytes into mid memory",
            input_bytes,
            self.blob.total
        );

        let input = dma.submit(self.staging(
            self.params.slow_input,
            self.params.mid_input,
            input_bytes,
            true,
        ));
        let weights = dma.submit(self.staging(
            self.params.slow_weights,
            self.params.mid_weights,
            self.blob.total,
            true,
        ));
        dma.wait(input);
        dma.wait(weights);
    }

    /// Copy the output tensor from mid back to slow memory.
    fn stage_out(&self, dma: &DmaEngine) {
        let bytes = self.tiles.output_tensor().bytes();
        log::debug!("Staging {} output bytes back to slow memory", bytes);
        dma.submit_and_wait(self.staging(
            self.params.slow_output,
            self.params.mid_output,
            bytes,
            false,
        ));
    }

    fn staging(&self, slow: u32, mid: u32, bytes: usize, inbound: bool) -> TransferDescriptor {
        let ext = Endpoint::new(MemoryTier::Slow, slow as u64);
        let loc = Endpoint::new(MemoryTier::Mid, mid as u64);
        let shape = TransferShape::contiguous(bytes as u32);
        if inbound {
            TransferDescriptor::inbound(TransferKind::Staging, ext, loc, shape)
        } else {
            TransferDescriptor::outbound(TransferKind::Staging, ext, loc, shape)
        }
    }
}
