//! Forward Error Correction Seam
//!
//! The engine launches the codec once per code block and never looks
//! inside it. Soft bits follow the convention positive = bit 0.

use tracing::debug;

use crate::InterfaceError;

/// Block encoder owned by one worker
pub trait Encoder: Send {
    /// Encode one code block.
    ///
    /// `info` holds packed information bytes (MSB first), `encoded` receives
    /// one bit per byte and fixes the encoded block length.
    fn encode(&mut self, info: &[u8], encoded: &mut [u8]);
}

/// Block decoder owned by one worker
pub trait Decoder: Send {
    /// Decode one code block of soft bits into packed bytes (MSB first)
    fn decode(&mut self, llr: &[i8], decoded: &mut [u8]);
}

/// Builds per-worker codec instances
pub trait CodecFactory: Send + Sync {
    fn encoder(&self) -> Box<dyn Encoder>;
    fn decoder(&self) -> Box<dyn Decoder>;

    /// Encoded bits produced for `info_bits` information bits
    fn encoded_len(&self, info_bits: usize) -> usize;
}

/// Repetition code: the information block is sent `factor` times and the
/// decoder combines soft bits of all copies
#[derive(Debug, Clone, Copy)]
pub struct RepetitionCodec {
    factor: usize,
}

impl RepetitionCodec {
    pub fn new(factor: usize) -> Result<Self, InterfaceError> {
        if factor == 0 {
            return Err(InterfaceError::InvalidConfig(
                "repetition factor must be positive".to_string(),
            ));
        }
        debug!("Repetition codec with factor {}", factor);
        Ok(Self { factor })
    }

    pub fn factor(&self) -> usize {
        self.factor
    }
}

impl CodecFactory for RepetitionCodec {
    fn encoder(&self) -> Box<dyn Encoder> {
        Box::new(RepetitionEncoder { factor: self.factor })
    }

    fn decoder(&self) -> Box<dyn Decoder> {
        Box::new(RepetitionDecoder { factor: self.factor })
    }

    fn encoded_len(&self, info_bits: usize) -> usize {
        info_bits * self.factor
    }
}

struct RepetitionEncoder {
    factor: usize,
}

impl Encoder for RepetitionEncoder {
    fn encode(&mut self, info: &[u8], encoded: &mut [u8]) {
        let info_bits = encoded.len() / self.factor;
        debug_assert!(info.len() * 8 >= info_bits);
        for i in 0..info_bits {
            let bit = (info[i / 8] >> (7 - i % 8)) & 1;
            for copy in 0..self.factor {
                encoded[copy * info_bits + i] = bit;
            }
        }
    }
}

struct RepetitionDecoder {
    factor: usize,
}

impl Decoder for RepetitionDecoder {
    fn decode(&mut self, llr: &[i8], decoded: &mut [u8]) {
        let info_bits = llr.len() / self.factor;
        decoded.fill(0);
        for i in 0..info_bits.min(decoded.len() * 8) {
            let sum: i32 = (0..self.factor)
                .map(|copy| llr[copy * info_bits + i] as i32)
                .sum();
            if sum < 0 {
                decoded[i / 8] |= 1 << (7 - i % 8);
            }
        }
    }
}
