//! Common Utilities
//!
//! Sample conversion helpers shared by the stage handlers and the loopback
//! conductor.

use num_complex::{Complex, Complex32};

/// Full-scale value of an `i16` sample
pub const SHRT_MAX_F: f32 = 32768.0;

/// Convert a fixed-point sample to floating point
pub fn cf32_from_ci16(sample: Complex<i16>) -> Complex32 {
    Complex32::new(sample.re as f32 / SHRT_MAX_F, sample.im as f32 / SHRT_MAX_F)
}

/// Convert a floating-point sample to fixed point, saturating at full scale
pub fn ci16_from_cf32(sample: Complex32) -> Complex<i16> {
    let conv = |v: f32| (v * SHRT_MAX_F).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    Complex::new(conv(sample.re), conv(sample.im))
}

/// Count differing bytes of two equally long buffers
pub fn count_byte_errors(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).filter(|(x, y)| x != y).count()
}
