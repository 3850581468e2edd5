//! Invocation parameter block and weight blob layout.
//!
//! The generator hands every layer a flat block of 32-bit words:
//!
//! | Word | Meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | input tensor, slow tier                   |
//! | 1    | output tensor, slow tier                  |
//! | 2    | weight blob, slow tier                    |
//! | 3    | input tensor, mid tier                    |
//! | 4    | second input staging buffer, mid tier     |
//! | 5    | output tensor, mid tier                   |
//! | 6    | weight blob, mid tier                     |
//! | 7    | scratchpad base, local tier               |
//! | 8    | non-zero when the slow tier is external   |
//! | 9    | output multiplier                         |
//! | 10   | input multiplier 1                        |
//! | 11   | input multiplier 2                        |
//! | 12   | output shift                              |
//!
//! Word 4 is only meaningful when the mid tier is double buffered at a
//! coarser granularity; the tile schedule here never reads it.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::LayerGeometry;

/// Number of words in a parameter block.
pub const PARAM_BLOCK_WORDS: usize = 13;

/// Malformed parameter block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamBlockError {
    #[error("parameter block has {got} words, expected {expected}")]
    TooShort { expected: usize, got: usize },

    #[error("parameter block byte length {0} is not a multiple of 4")]
    Unaligned(usize),

    #[error("output shift {0} out of range (must be < 32)")]
    ShiftOutOfRange(u32),
}

/// Decoded parameter block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamBlock {
    pub slow_input: u32,
    pub slow_output: u32,
    pub slow_weights: u32,
    pub mid_input: u32,
    pub mid_input_secondary: u32,
    pub mid_output: u32,
    pub mid_weights: u32,
    pub local_base: u32,
    /// Slow tier is real external memory rather than an alias of mid
    pub slow_is_external: bool,
    pub out_mult: u32,
    pub in_mult: [u32; 2],
    pub out_shift: u32,
}

impl ParamBlock {
    /// Decode from words. Extra trailing words are ignored.
    pub fn from_words(words: &[u32]) -> Result<Self, ParamBlockError> {
        if words.len() < PARAM_BLOCK_WORDS {
            return Err(ParamBlockError::TooShort { expected: PARAM_BLOCK_WORDS, got: words.len() });
        }
        if words[12] >= 32 {
            return Err(ParamBlockError::ShiftOutOfRange(words[12]));
        }

        Ok(Self {
            slow_input: words[0],
            slow_output: words[1],
            slow_weights: words[2],
            mid_input: words[3],
            mid_input_secondary: words[4],
            mid_output: words[5],
            mid_weights: words[6],
            local_base: words[7],
            slow_is_external: words[8] != 0,
            out_mult: words[9],
            in_mult: [words[10], words[11]],
            out_shift: words[12],
        })
    }

    /// Decode from little-endian bytes.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, ParamBlockError> {
        if bytes.len() % 4 != 0 {
            return Err(ParamBlockError::Unaligned(bytes.len()));
        }
        let mut words = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(bytes, &mut words);
        Self::from_words(&words)
    }

    /// Encode back into words.
    pub fn to_words(&self) -> [u32; PARAM_BLOCK_WORDS] {
        [
            self.slow_input,
            self.slow_output,
            self.slow_weights,
            self.mid_input,
            self.mid_input_secondary,
            self.mid_output,
            self.mid_weights,
            self.local_base,
            self.slow_is_external as u32,
            self.out_mult,
            self.in_mult[0],
            self.in_mult[1],
            self.out_shift,
        ]
    }

    /// Layer-wide requantization parameters.
    pub fn requant(&self) -> RequantParams {
        RequantParams { out_mult: self.out_mult, out_shift: self.out_shift }
    }
}

/// Layer-wide part of the requantization step. The per-channel kappa and
/// lambda arrays live in the weight blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequantParams {
    pub out_mult: u32,
    pub out_shift: u32,
}

/// Byte offsets inside the weight blob.
///
/// ```text
/// [ int8 weights C*K*K ][ pad to 4 ][ int32 kappa C ][ int32 lambda C ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightBlobLayout {
    pub weights: usize,
    pub kappa: usize,
    pub lambda: usize,
    pub total: usize,
}

impl WeightBlobLayout {
    pub fn for_geometry(geometry: &LayerGeometry) -> Self {
        let channels = geometry.input.channels;
        let weight_bytes = channels * geometry.kernel * geometry.kernel;
        let kappa = weight_bytes.next_multiple_of(4);
        let lambda = kappa + channels * 4;
        Self {
            weights: 0,
            kappa,
            lambda,
            total: lambda + channels * 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::tests::mobilenet_dw;
    use crate::layer::TensorShape;

    fn sample_words() -> [u32; PARAM_BLOCK_WORDS] {
        [
            0x1000_0000, 0x1100_0000, 0x1200_0000,
            0x0001_0000, 0x0002_0000, 0x0003_0000, 0x0004_0000,
            0x0000_0000, 0,
            1, 3, 5, 21,
        ]
    }

    #[test]
    fn test_decode_words() {
        let block = ParamBlock::from_words(&sample_words()).unwrap();

        assert_eq!(block.slow_input, 0x1000_0000);
        assert_eq!(block.mid_weights, 0x0004_0000);
        assert!(!block.slow_is_external);
        assert_eq!(block.in_mult, [3, 5]);
        assert_eq!(block.requant(), RequantParams { out_mult: 1, out_shift: 21 });
        assert_eq!(block.to_words(), sample_words());
    }

    #[test]
    fn test_decode_bytes() {
        let mut bytes = Vec::new();
        for word in sample_words() {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let block = ParamBlock::from_le_bytes(&bytes).unwrap();
        assert_eq!(block, ParamBlock::from_words(&sample_words()).unwrap());

        assert_eq!(ParamBlock::from_le_bytes(&bytes[..5]), Err(ParamBlockError::Unaligned(5)));
    }

    #[test]
    fn test_too_short() {
        let result = ParamBlock::from_words(&sample_words()[..9]);
        assert_eq!(result, Err(ParamBlockError::TooShort { expected: 13, got: 9 }));
    }

    #[test]
    fn test_shift_out_of_range() {
        let mut words = sample_words();
        words[12] = 40;
        assert_eq!(ParamBlock::from_words(&words), Err(ParamBlockError::ShiftOutOfRange(40)));
    }

    #[test]
    fn test_weight_blob_layout() {
        let blob = WeightBlobLayout::for_geometry(&mobilenet_dw());
        assert_eq!(blob, WeightBlobLayout { weights: 0, kappa: 2304, lambda: 3328, total: 4352 });
    }

    #[test]
    fn test_weight_blob_aligns_kappa() {
        let geometry = LayerGeometry {
            input: TensorShape::new(3, 16, 16),
            ..mobilenet_dw()
        };
        let blob = WeightBlobLayout::for_geometry(&geometry);
        // 27 weight bytes padded to 28
        assert_eq!(blob.kappa, 28);
        assert_eq!(blob.lambda, 40);
        assert_eq!(blob.total, 52);
    }
}
