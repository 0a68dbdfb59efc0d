//! UE-Specific Pilot Sequences
//!
//! QPSK pilots from the length-31 Gold sequence of 3GPP TS 38.211
//! Section 5.2.1, one sequence per UE antenna.

use num_complex::Complex32;

/// Gold sequence LFSR pair
pub struct GoldSequence {
    x1: u32,
    x2: u32,
}

impl GoldSequence {
    const NC: usize = 1600;

    pub fn new(c_init: u32) -> Self {
        let mut seq = Self {
            x1: 1,
            x2: c_init & 0x7FFF_FFFF,
        };
        for _ in 0..Self::NC {
            seq.advance();
        }
        seq
    }

    fn advance(&mut self) {
        // x1(n+31) = x1(n+3) + x1(n)
        let x1_new = ((self.x1 >> 3) ^ self.x1) & 1;
        self.x1 = (self.x1 >> 1) | (x1_new << 30);

        // x2(n+31) = x2(n+3) + x2(n+2) + x2(n+1) + x2(n)
        let x2_new = ((self.x2 >> 3) ^ (self.x2 >> 2) ^ (self.x2 >> 1) ^ self.x2) & 1;
        self.x2 = (self.x2 >> 1) | (x2_new << 30);
    }

    pub fn next_bit(&mut self) -> u8 {
        let c = (self.x1 ^ self.x2) & 1;
        self.advance();
        c as u8
    }

    /// Unit-power QPSK symbol from the next two bits
    pub fn next_qpsk(&mut self) -> Complex32 {
        let c0 = self.next_bit();
        let c1 = self.next_bit();
        Complex32::new(1.0 - 2.0 * c0 as f32, 1.0 - 2.0 * c1 as f32)
            * std::f32::consts::FRAC_1_SQRT_2
    }
}

/// Sequence initializer of one UE antenna
pub fn pilot_cinit(seed: u64, ue_ant: usize) -> u32 {
    (((seed as u32) << 10) ^ (ue_ant as u32 * 0x9E37 + 1)) & 0x7FFF_FFFF
}

/// Pilot of one UE antenna across `len` data subcarriers
pub fn ue_specific_pilot(seed: u64, ue_ant: usize, len: usize) -> Vec<Complex32> {
    let mut seq = GoldSequence::new(pilot_cinit(seed, ue_ant));
    (0..len).map(|_| seq.next_qpsk()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pilots_are_unit_power_and_distinct() {
        let a = ue_specific_pilot(7, 0, 64);
        let b = ue_specific_pilot(7, 1, 64);
        assert!(a.iter().all(|p| (p.norm() - 1.0).abs() < 1e-6));
        assert_ne!(a, b);
        assert_eq!(a, ue_specific_pilot(7, 0, 64));
    }

    #[test]
    fn test_gold_sequence_is_balanced() {
        let mut seq = GoldSequence::new(0x1234);
        let ones: usize = (0..4096).map(|_| seq.next_bit() as usize).sum();
        assert!((1800..2300).contains(&ones), "{} ones", ones);
    }
}
