//! Test fixtures for whole-layer runs.
//!
//! - [`LayerFixture`]: seeded random tensors, weights and requant arrays laid
//!   out in emulated memory the way the generator would place them
//! - [`reference_depthwise`]: untiled convolution over the whole tensor,
//!   the oracle tiled runs are compared against

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::device::{MemorySystem, MemoryTier};
use crate::kernel::depthwise::requantize;
use crate::layer::{LayerGeometry, ParamBlock, WeightBlobLayout};

pub(crate) const SLOW_INPUT: u32 = 0x1000_0000;
pub(crate) const SLOW_OUTPUT: u32 = 0x1100_0000;
pub(crate) const SLOW_WEIGHTS: u32 = 0x1200_0000;
pub(crate) const MID_INPUT: u32 = 0x0010_0000;
pub(crate) const MID_OUTPUT: u32 = 0x0020_0000;
pub(crate) const MID_WEIGHTS: u32 = 0x0030_0000;

/// Install a test logger once.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A layer with concrete data.
#[derive(Debug, Clone)]
pub(crate) struct LayerFixture {
    pub geometry: LayerGeometry,
    pub input: Vec<u8>,
    pub weights: Vec<i8>,
    pub kappa: Vec<i32>,
    pub lambda: Vec<i32>,
    pub out_shift: u32,
}

impl LayerFixture {
    /// Deterministic random data for `geometry`.
    pub fn random(geometry: &LayerGeometry, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let channels = geometry.input.channels;
        let taps = geometry.kernel * geometry.kernel;

        Self {
            geometry: geometry.clone(),
            input: (0..geometry.input.elements()).map(|_| rng.gen()).collect(),
            weights: (0..channels * taps).map(|_| rng.gen_range(-8..=8)).collect(),
            kappa: (0..channels).map(|_| rng.gen_range(1..=4)).collect(),
            lambda: (0..channels).map(|_| rng.gen_range(-512..=512)).collect(),
            out_shift: 4,
        }
    }

    /// Parameter block placing every tensor at the fixture addresses.
    pub fn params(&self, slow_is_external: bool) -> ParamBlock {
        ParamBlock {
            slow_input: SLOW_INPUT,
            slow_output: SLOW_OUTPUT,
            slow_weights: SLOW_WEIGHTS,
            mid_input: MID_INPUT,
            mid_input_secondary: 0,
            mid_output: MID_OUTPUT,
            mid_weights: MID_WEIGHTS,
            local_base: 0,
            slow_is_external,
            out_mult: 1,
            in_mult: [1, 1],
            out_shift: self.out_shift,
        }
    }

    /// Weight blob bytes: weights, then kappa, then lambda.
    pub fn weight_blob(&self) -> Vec<u8> {
        let layout = WeightBlobLayout::for_geometry(&self.geometry);
        let mut blob = vec![0u8; layout.total];
        for (dst, w) in blob.iter_mut().zip(&self.weights) {
            *dst = *w as u8;
        }
        for (i, (k, l)) in self.kappa.iter().zip(&self.lambda).enumerate() {
            let (kappa, lambda) = (layout.kappa + i * 4, layout.lambda + i * 4);
            blob[kappa..kappa + 4].copy_from_slice(&k.to_le_bytes());
            blob[lambda..lambda + 4].copy_from_slice(&l.to_le_bytes());
        }
        blob
    }

    /// Tier the generator leaves the tensors in.
    fn home(params: &ParamBlock) -> (MemoryTier, u32, u32, u32) {
        if params.slow_is_external {
            (MemoryTier::Slow, params.slow_input, params.slow_weights, params.slow_output)
        } else {
            (MemoryTier::Mid, params.mid_input, params.mid_weights, params.mid_output)
        }
    }

    /// Write the input tensor and weight blob into memory.
    pub fn install(&self, memory: &MemorySystem, params: &ParamBlock) {
        let (tier, input, weights, _) = Self::home(params);
        let mut mem = memory.lock(tier);
        mem.write_bytes(input as u64, &self.input);
        mem.write_bytes(weights as u64, &self.weight_blob());
    }

    /// Read the output tensor back.
    pub fn read_output(&self, memory: &MemorySystem, params: &ParamBlock) -> Vec<u8> {
        let (tier, _, _, output) = Self::home(params);
        memory
            .lock(tier)
            .read_vec(output as u64, self.geometry.output().elements())
    }

    /// Expected output tensor.
    pub fn expected(&self) -> Vec<u8> {
        reference_depthwise(
            &self.geometry,
            &self.input,
            &self.weights,
            &self.kappa,
            &self.lambda,
            self.out_shift,
        )
    }
}

/// Untiled depthwise convolution with requantization over a whole HWC tensor.
pub(crate) fn reference_depthwise(
    geometry: &LayerGeometry,
    input: &[u8],
    weights: &[i8],
    kappa: &[i32],
    lambda: &[i32],
    out_shift: u32,
) -> Vec<u8> {
    let in_shape = geometry.input;
    let out_shape = geometry.output();
    let (k, s) = (geometry.kernel, geometry.stride);
    let (pt, pl) = (geometry.padding.top as isize, geometry.padding.left as isize);
    let mut out = vec![0u8; out_shape.elements()];

    for oy in 0..out_shape.height {
        for ox in 0..out_shape.width {
            for c in 0..out_shape.channels {
                let mut acc: i64 = 0;
                for kh in 0..k {
                    let iy = (oy * s + kh) as isize - pt;
                    if iy < 0 || iy >= in_shape.height as isize {
                        continue;
                    }
                    for kw in 0..k {
                        let ix = (ox * s + kw) as isize - pl;
                        if ix < 0 || ix >= in_shape.width as isize {
                            continue;
                        }
                        let pixel =
                            (iy as usize * in_shape.width + ix as usize) * in_shape.channels + c;
                        acc += input[pixel] as i64 * weights[(c * k + kh) * k + kw] as i64;
                    }
                }
                out[(oy * out_shape.width + ox) * out_shape.channels + c] =
                    requantize(acc, kappa[c], lambda[c], out_shift);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::tests::mobilenet_dw;

    #[test]
    fn test_fixture_is_deterministic() {
        let a = LayerFixture::random(&mobilenet_dw(), 7);
        let b = LayerFixture::random(&mobilenet_dw(), 7);
        assert_eq!(a.input, b.input);
        assert_eq!(a.weights, b.weights);
        assert_ne!(a.input, LayerFixture::random(&mobilenet_dw(), 8).input);
    }

    #[test]
    fn test_weight_blob_layout() {
        let fixture = LayerFixture::random(&mobilenet_dw(), 1);
        let blob = fixture.weight_blob();
        assert_eq!(blob.len(), 4352);
        assert_eq!(blob[5] as i8, fixture.weights[5]);
        let word = |at: usize| {
            i32::from_le_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]])
        };
        assert_eq!(word(2304), fixture.kappa[0]);
        assert_eq!(word(3328), fixture.lambda[0]);
    }

    #[test]
    fn test_reference_identity_kernel() {
        // centre tap 1, kappa 1, lambda 0, shift 0: output equals input
        let geometry = mobilenet_dw();
        let mut fixture = LayerFixture::random(&geometry, 3);
        fixture.weights = (0..256 * 9).map(|i| if i % 9 == 4 { 1 } else { 0 }).collect();
        fixture.kappa = vec![1; 256];
        fixture.lambda = vec![0; 256];
        fixture.out_shift = 0;

        assert_eq!(fixture.expected(), fixture.input);
    }
}
