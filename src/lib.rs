//! cluster-tiler library
//!
//! Tile scheduling and double-buffered DMA for running a depthwise
//! convolution layer on a multi-unit accelerator cluster whose local
//! scratchpad is far smaller than the tensors.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cluster_tiler::config::EngineConfig;
//! use cluster_tiler::device::MemorySystem;
//! use cluster_tiler::executor::LayerExecutor;
//! use cluster_tiler::kernel::DepthwiseBnRelu;
//! use cluster_tiler::layer::{BlockSizes, LayerGeometry, Padding, ParamBlock, TensorShape};
//!
//! let geometry = LayerGeometry {
//!     input: TensorShape::new(16, 8, 8),
//!     kernel: 3,
//!     stride: 1,
//!     padding: Padding::uniform(1),
//!     block: BlockSizes { channels: 8, height: 4, width: 8 },
//!     element_bits: 8,
//!     workspace_bytes: 0,
//! };
//! let params = ParamBlock {
//!     mid_input: 0x1_0000,
//!     mid_output: 0x2_0000,
//!     mid_weights: 0x3_0000,
//!     ..ParamBlock::default()
//! };
//!
//! let memory = Arc::new(MemorySystem::new(64 * 1024));
//! let kernel = DepthwiseBnRelu::new();
//! let executor = LayerExecutor::new(geometry, params, EngineConfig::default(), &kernel).unwrap();
//! let report = executor.run(&memory).unwrap();
//! assert_eq!(report.iterations, 4);
//! assert_eq!(report.prefetches, 3);
//! ```

pub mod config;
pub mod device;
pub mod layer;
pub mod schedule;
pub mod cluster;
pub mod kernel;
pub mod executor;

#[cfg(test)]
pub(crate) mod testing;
