//! Constellation Mapping and Soft Demodulation
//!
//! Gray mapping as in 3GPP TS 38.211 Section 5.1. A symbol index carries its
//! first bit in the MSB. Soft bits are scaled `i8` values, positive for a 0
//! bit, produced per bit in transmission order.

use common::ModulationScheme;
use num_complex::Complex32;

/// Soft-bit scale applied to unit-spaced decision distances
pub const LLR_GAIN: f32 = 16.0;

/// Precomputed constellation for one modulation scheme
#[derive(Debug, Clone)]
pub struct ModulationTable {
    scheme: ModulationScheme,
    points: Vec<Complex32>,
}

impl ModulationTable {
    pub fn new(scheme: ModulationScheme) -> Self {
        let bits = scheme.bits_per_symbol();
        let points = (0..1usize << bits)
            .map(|index| {
                let b: Vec<f32> = (0..bits)
                    .map(|k| 1.0 - 2.0 * ((index >> (bits - 1 - k)) & 1) as f32)
                    .collect();
                map_point(scheme, &b)
            })
            .collect();
        Self { scheme, points }
    }

    pub fn scheme(&self) -> ModulationScheme {
        self.scheme
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.scheme.bits_per_symbol()
    }

    /// Map one symbol index to its constellation point
    pub fn map(&self, index: u8) -> Complex32 {
        self.points[index as usize & (self.points.len() - 1)]
    }
}

/// `b[k]` holds `1 - 2 * bit_k`
fn map_point(scheme: ModulationScheme, b: &[f32]) -> Complex32 {
    match scheme {
        ModulationScheme::Bpsk => {
            let v = b[0] * std::f32::consts::FRAC_1_SQRT_2;
            Complex32::new(v, v)
        }
        ModulationScheme::Qpsk => {
            Complex32::new(b[0], b[1]) * std::f32::consts::FRAC_1_SQRT_2
        }
        ModulationScheme::Qam16 => {
            let scale = 1.0 / 10.0_f32.sqrt();
            Complex32::new(b[0] * (2.0 - b[2]), b[1] * (2.0 - b[3])) * scale
        }
        ModulationScheme::Qam64 => {
            let scale = 1.0 / 42.0_f32.sqrt();
            Complex32::new(
                b[0] * (4.0 - b[2] * (2.0 - b[4])),
                b[1] * (4.0 - b[3] * (2.0 - b[5])),
            ) * scale
        }
        ModulationScheme::Qam256 => {
            let scale = 1.0 / 170.0_f32.sqrt();
            Complex32::new(
                b[0] * (8.0 - b[2] * (4.0 - b[4] * (2.0 - b[6]))),
                b[1] * (8.0 - b[3] * (4.0 - b[5] * (2.0 - b[7]))),
            ) * scale
        }
    }
}

fn quantize(v: f32) -> i8 {
    (v * LLR_GAIN).round().clamp(-127.0, 127.0) as i8
}

/// Soft-demodulate `input` into `bits_per_symbol` soft bits per point.
///
/// Returns `false` without touching `out` when the scheme has no soft
/// demapper.
pub fn demodulate_soft(scheme: ModulationScheme, input: &[Complex32], out: &mut [i8]) -> bool {
    match scheme {
        ModulationScheme::Bpsk => {
            for (x, llr) in input.iter().zip(out.iter_mut()) {
                *llr = quantize((x.re + x.im) * std::f32::consts::FRAC_1_SQRT_2);
            }
        }
        ModulationScheme::Qpsk => {
            let s = std::f32::consts::SQRT_2;
            for (x, llr) in input.iter().zip(out.chunks_exact_mut(2)) {
                llr[0] = quantize(x.re * s);
                llr[1] = quantize(x.im * s);
            }
        }
        ModulationScheme::Qam16 => {
            let s = 10.0_f32.sqrt();
            for (x, llr) in input.iter().zip(out.chunks_exact_mut(4)) {
                let (re, im) = (x.re * s, x.im * s);
                llr[0] = quantize(re);
                llr[1] = quantize(im);
                llr[2] = quantize(2.0 - re.abs());
                llr[3] = quantize(2.0 - im.abs());
            }
        }
        ModulationScheme::Qam64 => {
            let s = 42.0_f32.sqrt();
            for (x, llr) in input.iter().zip(out.chunks_exact_mut(6)) {
                let (re, im) = (x.re * s, x.im * s);
                llr[0] = quantize(re);
                llr[1] = quantize(im);
                llr[2] = quantize(4.0 - re.abs());
                llr[3] = quantize(4.0 - im.abs());
                llr[4] = quantize(2.0 - (re.abs() - 4.0).abs());
                llr[5] = quantize(2.0 - (im.abs() - 4.0).abs());
            }
        }
        ModulationScheme::Qam256 => return false,
    }
    true
}

/// Hard decision on soft bits; zero resolves to bit 0
pub fn hard_decision(llr: &[i8], bits: &mut [u8]) {
    for (b, &l) in bits.iter_mut().zip(llr) {
        *b = (l < 0) as u8;
    }
}
