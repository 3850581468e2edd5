//! Tile addressing: from a tile coordinate to a transfer.
//!
//! Tensors are stored HWC with 8-bit elements, so a tile is a box of
//! `rows x cols x channels` and its transfer is:
//!
//! ```text
//! run    = channel slice of one pixel     (channels * element bytes)
//! middle = pixels of one row              (stride = pixel stride)
//! outer  = rows of the tile               (stride = row stride)
//! ```
//!
//! Input windows follow the convolution. For an output span `[o, o + n)`
//! along an axis the input rows needed are
//! `[o*s - pad, (o + n - 1)*s - pad + k)`, clamped to the tensor. The first
//! tile starts at row 0 and lets the kernel synthesize the padding; every
//! later tile starts `pad` rows earlier than `o*s`, overlapping the tile
//! before it.
//!
//! Everything here is pure: no state, no side effects.

use crate::device::dma::{Endpoint, TransferShape};

use super::grid::TileCoord;
use super::params::WeightBlobLayout;
use super::{LayerGeometry, TensorShape};

/// Half-open index range `[start, start + len)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Convolution parameters along one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisConv {
    pub in_dim: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad_before: usize,
    pub pad_after: usize,
}

impl AxisConv {
    /// Output extent along this axis.
    pub fn out_dim(&self) -> usize {
        let padded = self.in_dim + self.pad_before + self.pad_after;
        padded.saturating_sub(self.kernel) / self.stride + 1
    }

    /// Output span of block `index`. The last block gets the remainder.
    pub fn output_span(&self, index: usize, block: usize) -> Span {
        let start = index * block;
        Span::new(start, block.min(self.out_dim().saturating_sub(start)))
    }

    /// Input span feeding output span `out`.
    ///
    /// `follows_boundary` is the edge-overlap flag: the tile comes after the
    /// boundary tile, which already consumed the padding position, so its
    /// window starts `pad_before` rows before `out.start * stride`.
    pub fn input_span(&self, out: Span, follows_boundary: bool) -> Span {
        let shift = if follows_boundary { self.pad_before } else { 0 };
        let start = (out.start * self.stride).saturating_sub(shift);

        let last_out = out.end().saturating_sub(1);
        let end = (last_out * self.stride + self.kernel)
            .saturating_sub(self.pad_before)
            .min(self.in_dim);

        Span::new(start, end.saturating_sub(start))
    }

    /// Largest input window an output block of `block` can need.
    pub fn max_window(&self, block: usize) -> usize {
        ((block.saturating_sub(1)) * self.stride + self.kernel).min(self.in_dim)
    }
}

/// Extent of a tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileDims {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
}

impl TileDims {
    /// Bytes of the packed tile (8-bit elements).
    pub fn bytes(&self) -> usize {
        self.rows * self.cols * self.channels
    }
}

/// Resolved source (or destination) of one tile transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileTransfer {
    /// Strided endpoint of the tile
    pub ext: Endpoint,
    pub shape: TransferShape,
    pub dims: TileDims,
}

/// An HWC tensor placed in some tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub shape: TensorShape,
    pub element_bits: u32,
    pub base: Endpoint,
}

impl TensorDescriptor {
    pub fn new(shape: TensorShape, element_bits: u32, base: Endpoint) -> Self {
        Self { shape, element_bits, base }
    }

    #[inline]
    pub fn element_bytes(&self) -> usize {
        (self.element_bits as usize).div_ceil(8)
    }

    /// Bytes between horizontally adjacent pixels.
    #[inline]
    pub fn pixel_stride(&self) -> usize {
        self.shape.channels * self.element_bytes()
    }

    /// Bytes between vertically adjacent rows.
    #[inline]
    pub fn row_stride(&self) -> usize {
        self.shape.width * self.pixel_stride()
    }

    /// Size of the whole tensor in bytes.
    pub fn bytes(&self) -> usize {
        self.shape.elements() * self.element_bytes()
    }

    /// Transfer covering a box of the tensor.
    pub fn window(&self, rows: Span, cols: Span, channels: Span) -> TileTransfer {
        let eb = self.element_bytes();
        let offset =
            rows.start * self.row_stride() + cols.start * self.pixel_stride() + channels.start * eb;

        TileTransfer {
            ext: self.base.offset(offset as i64),
            shape: TransferShape::new_3d(
                (channels.len * eb) as u32,
                cols.len as u32,
                self.pixel_stride() as i64,
                rows.len as u32,
                self.row_stride() as i64,
            ),
            dims: TileDims { rows: rows.len, cols: cols.len, channels: channels.len },
        }
    }
}

/// Addressing of every tile of one layer invocation.
#[derive(Debug, Clone)]
pub struct TileAddressing {
    geometry: LayerGeometry,
    input: TensorDescriptor,
    output: TensorDescriptor,
    weights: Endpoint,
    blob: WeightBlobLayout,
}

impl TileAddressing {
    /// Addressing for tensors at `input`, `output` and a weight blob at
    /// `weights` (int8 weights, then kappa, then lambda).
    pub fn new(
        geometry: &LayerGeometry,
        input: Endpoint,
        output: Endpoint,
        weights: Endpoint,
    ) -> Self {
        Self {
            geometry: geometry.clone(),
            input: TensorDescriptor::new(geometry.input, geometry.element_bits, input),
            output: TensorDescriptor::new(geometry.output(), geometry.element_bits, output),
            weights,
            blob: WeightBlobLayout::for_geometry(geometry),
        }
    }

    pub fn input_tensor(&self) -> &TensorDescriptor {
        &self.input
    }

    pub fn output_tensor(&self) -> &TensorDescriptor {
        &self.output
    }

    /// Channel span of a channel block.
    pub fn channel_span(&self, block: usize) -> Span {
        let start = block * self.geometry.block.channels;
        let remaining = self.geometry.input.channels.saturating_sub(start);
        Span::new(start, self.geometry.block.channels.min(remaining))
    }

    /// Output rows and columns of a tile.
    pub fn output_spans(&self, coord: TileCoord) -> (Span, Span) {
        (
            self.geometry.rows().output_span(coord.height, self.geometry.block.height),
            self.geometry.cols().output_span(coord.width, self.geometry.block.width),
        )
    }

    /// Input tile feeding the output tile at `coord`.
    pub fn input_tile(&self, coord: TileCoord) -> TileTransfer {
        let (out_rows, out_cols) = self.output_spans(coord);
        let rows = self.geometry.rows().input_span(out_rows, coord.height > 0);
        let cols = self.geometry.cols().input_span(out_cols, coord.width > 0);
        self.input.window(rows, cols, self.channel_span(coord.in_channel))
    }

    /// Output tile at `coord`.
    pub fn output_tile(&self, coord: TileCoord) -> TileTransfer {
        let (rows, cols) = self.output_spans(coord);
        self.output.window(rows, cols, self.channel_span(coord.out_channel))
    }

    /// Weight tile of a channel block: `channels` blocks of `k*k` bytes.
    pub fn weight_tile(&self, block: usize) -> TileTransfer {
        let channels = self.channel_span(block);
        let taps = self.geometry.kernel * self.geometry.kernel;
        TileTransfer {
            ext: self.weights.offset((self.blob.weights + channels.start * taps) as i64),
            shape: TransferShape::new_3d(taps as u32, 1, 0, channels.len as u32, taps as i64),
            dims: TileDims {
                rows: self.geometry.kernel,
                cols: self.geometry.kernel,
                channels: channels.len,
            },
        }
    }

    /// Kappa (multiplier) array slice of a channel block.
    pub fn kappa_tile(&self, block: usize) -> TileTransfer {
        self.requant_array(self.blob.kappa, block)
    }

    /// Lambda (bias) array slice of a channel block.
    pub fn lambda_tile(&self, block: usize) -> TileTransfer {
        self.requant_array(self.blob.lambda, block)
    }

    fn requant_array(&self, array_offset: usize, block: usize) -> TileTransfer {
        let channels = self.channel_span(block);
        TileTransfer {
            ext: self.weights.offset((array_offset + channels.start * 4) as i64),
            shape: TransferShape::contiguous((channels.len * 4) as u32),
            dims: TileDims { rows: 1, cols: 1, channels: channels.len },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryTier;
    use crate::layer::tests::mobilenet_dw;
    use crate::layer::{BlockSizes, TensorShape};

    fn addressing(geometry: &LayerGeometry) -> TileAddressing {
        TileAddressing::new(
            geometry,
            Endpoint::new(MemoryTier::Mid, 0x1_0000),
            Endpoint::new(MemoryTier::Mid, 0x2_0000),
            Endpoint::new(MemoryTier::Mid, 0x3_0000),
        )
    }

    #[test]
    fn test_input_tile_whole_plane() {
        let geometry = mobilenet_dw();
        let tiles = addressing(&geometry);

        let tile = tiles.input_tile(TileCoord::new(1, 0, 0));
        assert_eq!(tile.ext.addr, 0x1_0000 + 32);
        assert_eq!(tile.shape, TransferShape::new_3d(32, 16, 256, 16, 4096));
        assert_eq!(tile.dims, TileDims { rows: 16, cols: 16, channels: 32 });
        assert_eq!(tile.dims.bytes(), 8192);
    }

    #[test]
    fn test_weight_and_requant_offsets() {
        let geometry = mobilenet_dw();
        let tiles = addressing(&geometry);

        let weights = tiles.weight_tile(1);
        assert_eq!(weights.ext.addr, 0x3_0000 + 288);
        assert_eq!(weights.shape.total_bytes(), 288);

        // kappa after 256 * 9 weight bytes, lambda after 256 kappa words
        assert_eq!(tiles.kappa_tile(1).ext.addr, 0x3_0000 + 2304 + 128);
        assert_eq!(tiles.lambda_tile(1).ext.addr, 0x3_0000 + 3328 + 128);
        assert_eq!(tiles.lambda_tile(1).shape.total_bytes(), 128);
    }

    #[test]
    fn test_input_span_overlap() {
        let conv = AxisConv { in_dim: 10, kernel: 3, stride: 1, pad_before: 1, pad_after: 1 };

        // first block: padding synthesized, window starts at 0
        assert_eq!(conv.input_span(conv.output_span(0, 4), false), Span::new(0, 5));
        // interior block: starts one row early, full k-1 halo
        assert_eq!(conv.input_span(conv.output_span(1, 4), true), Span::new(3, 6));
        // remainder block: 2 output rows, clipped at the bottom edge
        assert_eq!(conv.output_span(2, 4), Span::new(8, 2));
        assert_eq!(conv.input_span(conv.output_span(2, 4), true), Span::new(7, 3));
    }

    #[test]
    fn test_input_span_strided() {
        let conv = AxisConv { in_dim: 16, kernel: 3, stride: 2, pad_before: 1, pad_after: 1 };
        assert_eq!(conv.out_dim(), 8);

        assert_eq!(conv.input_span(conv.output_span(0, 4), false), Span::new(0, 8));
        // outputs 4..8 read rows 7..16
        assert_eq!(conv.input_span(conv.output_span(1, 4), true), Span::new(7, 9));
        assert_eq!(conv.max_window(4), 9);
    }

    #[test]
    fn test_remainder_tiles() {
        let geometry = LayerGeometry {
            input: TensorShape::new(20, 10, 7),
            block: BlockSizes { channels: 8, height: 4, width: 3 },
            ..mobilenet_dw()
        };
        let tiles = addressing(&geometry);

        let last = TileCoord::new(2, 2, 2);
        let out = tiles.output_tile(last);
        assert_eq!(out.dims, TileDims { rows: 2, cols: 1, channels: 4 });
        assert_eq!(out.ext.addr, 0x2_0000 + (8 * 7 * 20 + 6 * 20 + 16) as u64);
        assert_eq!(out.shape, TransferShape::new_3d(4, 1, 20, 2, 140));

        let input = tiles.input_tile(last);
        assert_eq!(input.dims, TileDims { rows: 3, cols: 2, channels: 4 });
        assert_eq!(input.ext.addr, 0x1_0000 + (7 * 140 + 5 * 20 + 16) as u64);
    }

    #[test]
    fn test_input_tiles_never_exceed_slot() {
        let geometry = LayerGeometry {
            input: TensorShape::new(20, 10, 7),
            block: BlockSizes { channels: 8, height: 4, width: 3 },
            ..mobilenet_dw()
        };
        let tiles = addressing(&geometry);

        for coord in geometry.grid().iter() {
            assert!(tiles.input_tile(coord).dims.bytes() <= geometry.max_input_tile_bytes());
            assert!(tiles.output_tile(coord).dims.bytes() <= geometry.max_output_tile_bytes());
        }
    }
}
