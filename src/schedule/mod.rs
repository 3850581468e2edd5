//! Tile loop scheduling.
//!
//! - [`DoubleBufferScheduler`]: per-role slot parity
//! - [`TileLoopController`]: grid walk with one-ahead prefetch, yielding an
//!   [`IterationPlan`] per tile

pub mod double_buffer;
pub mod tile_loop;

pub use double_buffer::{DoubleBufferScheduler, RoleSlots, SlotAssignment};
pub use tile_loop::{IterationPlan, TileLoopController};
