//! Layer geometry as emitted by the tiling generator.
//!
//! A layer is a depthwise convolution over an HWC tensor. The generator
//! picks output block sizes per axis; everything else (grid sizes, tile
//! windows, slot sizes) is derived here.
//!
//! # Geometry File Format
//!
//! ```toml
//! kernel = 3
//! stride = 1
//! element_bits = 8
//! workspace_bytes = 912
//!
//! [input]
//! channels = 256
//! height = 16
//! width = 16
//!
//! [padding]
//! top = 1
//! bottom = 1
//! left = 1
//! right = 1
//!
//! [block]
//! channels = 32
//! height = 16
//! width = 16
//! ```

pub mod addressing;
pub mod grid;
pub mod params;
pub mod scratch;

pub use addressing::{AxisConv, Span, TensorDescriptor, TileAddressing, TileDims, TileTransfer};
pub use grid::{GridDims, PaddingFlags, TileCoord};
pub use params::{ParamBlock, ParamBlockError, RequantParams, WeightBlobLayout};
pub use scratch::{BufferRole, LayoutError, Parity, ScratchLayout, SlotPair};

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Channels, height and width of an HWC tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    /// Element count.
    pub fn elements(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Zero padding per side, in elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    #[serde(default)]
    pub top: usize,
    #[serde(default)]
    pub bottom: usize,
    #[serde(default)]
    pub left: usize,
    #[serde(default)]
    pub right: usize,
}

impl Padding {
    /// Same padding on every side.
    pub fn uniform(pad: usize) -> Self {
        Self { top: pad, bottom: pad, left: pad, right: pad }
    }
}

/// Output block sizes chosen by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSizes {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

/// Geometry error, raised before a layer runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("only 8-bit elements are supported, got {0} bits")]
    UnsupportedElementBits(u32),

    #[error("kernel {kernel} does not fit padded {axis} extent {extent}")]
    KernelTooLarge { axis: &'static str, kernel: usize, extent: usize },

    #[error("{axis} block {block} exceeds output extent {extent}")]
    BlockExceedsDimension { axis: &'static str, block: usize, extent: usize },

    /// A non-boundary tile would need padding positions.
    #[error("{axis} padding {pad} cannot be confined to boundary tiles (block {block}, stride {stride})")]
    PaddingSpansTiles { axis: &'static str, pad: usize, block: usize, stride: usize },
}

/// Geometry of one depthwise layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerGeometry {
    /// Input tensor shape (HWC)
    pub input: TensorShape,
    /// Square kernel size
    pub kernel: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: Padding,
    /// Output block sizes
    pub block: BlockSizes,
    #[serde(default = "default_element_bits")]
    pub element_bits: u32,
    /// Kernel workspace reserved in the scratchpad
    #[serde(default)]
    pub workspace_bytes: usize,
}

fn default_stride() -> usize {
    1
}

fn default_element_bits() -> u32 {
    8
}

impl LayerGeometry {
    /// Parse a geometry from TOML text.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let geometry: Self = toml::from_str(text).context("invalid layer geometry")?;
        geometry.validate()?;
        Ok(geometry)
    }

    /// Load and validate a geometry file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let geometry = Self::from_toml_str(&text)
            .with_context(|| format!("in {}", path.display()))?;
        log::info!("Loaded layer geometry from {}", path.display());
        Ok(geometry)
    }

    /// Bytes per element.
    pub fn element_bytes(&self) -> usize {
        (self.element_bits as usize).div_ceil(8)
    }

    /// Convolution parameters along the height axis.
    pub fn rows(&self) -> AxisConv {
        AxisConv {
            in_dim: self.input.height,
            kernel: self.kernel,
            stride: self.stride,
            pad_before: self.padding.top,
            pad_after: self.padding.bottom,
        }
    }

    /// Convolution parameters along the width axis.
    pub fn cols(&self) -> AxisConv {
        AxisConv {
            in_dim: self.input.width,
            kernel: self.kernel,
            stride: self.stride,
            pad_before: self.padding.left,
            pad_after: self.padding.right,
        }
    }

    /// Output tensor shape. Depthwise: channels pass through.
    pub fn output(&self) -> TensorShape {
        TensorShape {
            channels: self.input.channels,
            height: self.rows().out_dim(),
            width: self.cols().out_dim(),
        }
    }

    /// Tile grid over the output tensor.
    pub fn grid(&self) -> GridDims {
        let out = self.output();
        GridDims::new(
            out.channels.div_ceil(self.block.channels),
            out.height.div_ceil(self.block.height),
            out.width.div_ceil(self.block.width),
        )
    }

    /// Largest input tile in bytes.
    pub fn max_input_tile_bytes(&self) -> usize {
        self.rows().max_window(self.block.height)
            * self.cols().max_window(self.block.width)
            * self.block.channels
            * self.element_bytes()
    }

    /// Largest output tile in bytes.
    pub fn max_output_tile_bytes(&self) -> usize {
        self.block.height * self.block.width * self.block.channels * self.element_bytes()
    }

    /// Largest weight tile in bytes (int8 `[C][K][K]`).
    pub fn max_weight_tile_bytes(&self) -> usize {
        self.block.channels * self.kernel * self.kernel
    }

    /// Bytes of one kappa/lambda pair slot (two int32 arrays).
    pub fn requant_pair_bytes(&self) -> usize {
        2 * self.block.channels * 4
    }

    /// Check the geometry can be tiled correctly.
    pub fn validate(&self) -> Result<(), GeometryError> {
        let nonzero = [
            ("input channels", self.input.channels),
            ("input height", self.input.height),
            ("input width", self.input.width),
            ("kernel", self.kernel),
            ("stride", self.stride),
            ("channel block", self.block.channels),
            ("height block", self.block.height),
            ("width block", self.block.width),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(GeometryError::Zero(*name));
        }
        if self.element_bits != 8 {
            return Err(GeometryError::UnsupportedElementBits(self.element_bits));
        }

        for (axis, conv, block) in [
            ("height", self.rows(), self.block.height),
            ("width", self.cols(), self.block.width),
        ] {
            let extent = conv.in_dim + conv.pad_before + conv.pad_after;
            if conv.kernel > extent {
                return Err(GeometryError::KernelTooLarge { axis, kernel: conv.kernel, extent });
            }
            let out = conv.out_dim();
            if block > out {
                return Err(GeometryError::BlockExceedsDimension { axis, block, extent: out });
            }
            if out.div_ceil(block) > 1 {
                if block * conv.stride < conv.pad_before {
                    return Err(GeometryError::PaddingSpansTiles {
                        axis, pad: conv.pad_before, block, stride: conv.stride,
                    });
                }
                if conv.pad_after > conv.stride {
                    return Err(GeometryError::PaddingSpansTiles {
                        axis, pad: conv.pad_after, block, stride: conv.stride,
                    });
                }
            }
        }

        if self.block.channels > self.input.channels {
            return Err(GeometryError::BlockExceedsDimension {
                axis: "channel",
                block: self.block.channels,
                extent: self.input.channels,
            });
        }

        Ok(())
    }
}
