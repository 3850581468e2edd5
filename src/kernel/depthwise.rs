//! Reference depthwise kernel with folded batch-norm and clipping.
//!
//! ```text
//! acc[y][x][c] = sum_{kh,kw} in[y*s + kh - pt][x*s + kw - pl][c] * w[c][kh][kw]
//! out[y][x][c] = clip_u8((acc * kappa[c] + lambda[c]) >> shift)
//! ```
//!
//! `pt`/`pl` are the top/left padding amounts when the tile sits on that
//! boundary and zero otherwise. Input positions outside the tile read as
//! zero. Units split the output channels in contiguous chunks.

use crate::cluster::UnitId;
use crate::device::{MemorySystem, MemoryTier};

use super::{ComputeKernel, KernelCall};

/// Fixed-point depthwise convolution, BN affine and ReLU clip.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthwiseBnRelu;

impl DepthwiseBnRelu {
    pub fn new() -> Self {
        Self
    }
}

/// Requantize an accumulator into an activation.
#[inline]
pub fn requantize(acc: i64, kappa: i32, lambda: i32, shift: u32) -> u8 {
    let scaled = (acc * kappa as i64 + lambda as i64) >> shift;
    scaled.clamp(0, u8::MAX as i64) as u8
}

impl ComputeKernel for DepthwiseBnRelu {
    fn invoke(&self, unit: UnitId, call: &KernelCall, memory: &MemorySystem) {
        let channels = unit.share(call.out_channels);
        if channels.is_empty() {
            return;
        }

        let k = call.kernel_size;
        let in_dims = call.input_dims;
        let (input, weights, kappa, lambda) = {
            let local = memory.lock(MemoryTier::Local);
            (
                local.read_vec(call.input, in_dims.bytes()),
                local.read_vec(call.weights, call.out_channels * k * k),
                local.read_i32_vec(call.kappa, call.out_channels),
                local.read_i32_vec(call.lambda, call.out_channels),
            )
        };

        let row_shift = if call.padding_flags.top { call.padding.top as isize } else { 0 };
        let col_shift = if call.padding_flags.left { call.padding.left as isize } else { 0 };
        let out_dims = call.output_dims;
        let mut results = Vec::with_capacity(out_dims.rows * out_dims.cols * channels.len());

        for y in 0..out_dims.rows {
            for x in 0..out_dims.cols {
                for c in channels.clone() {
                    let mut acc: i64 = 0;
                    for kh in 0..k {
                        let row = (y * call.stride + kh) as isize - row_shift;
                        if row < 0 || row >= in_dims.rows as isize {
                            continue;
                        }
                        for kw in 0..k {
                            let col = (x * call.stride + kw) as isize - col_shift;
                            if col < 0 || col >= in_dims.cols as isize {
                                continue;
                            }
                            let pixel =
                                (row as usize * in_dims.cols + col as usize) * in_dims.channels + c;
                            let tap = weights[(c * k + kh) * k + kw] as i8;
                            acc += input[pixel] as i64 * tap as i64;
                        }
                    }
                    let offset = (y * out_dims.cols + x) * out_dims.channels + c;
                    let value = requantize(acc, kappa[c], lambda[c], call.requant.out_shift);
                    results.push((offset, value));
                }
            }
        }

        let mut local = memory.lock(MemoryTier::Local);
        for (offset, value) in results {
            local.write_u8(call.output + offset as u64, value);
        }
    }

    fn name(&self) -> &str {
        "depthwise_bn_relu"
    }
}
