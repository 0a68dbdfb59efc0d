//! Subcarrier Gather
//!
//! Collects `SCS_PER_CACHELINE` subcarriers across all base-station antennas
//! from a partial-transpose symbol into a row-major `[sc][ant]` block.
//! The grouped path moves four antennas per step and must stay bit-identical
//! to the scalar path.

use common::{SCS_PER_CACHELINE, TRANSPOSE_BLOCK_SIZE};
use num_complex::Complex32;

/// Antennas moved per step by the grouped gather
pub const ANTS_PER_GROUP: usize = 4;

fn block_base(sc0: usize, bs_ant: usize) -> usize {
    (sc0 / TRANSPOSE_BLOCK_SIZE) * (TRANSPOSE_BLOCK_SIZE * bs_ant)
}

/// Reference implementation, one element at a time
pub fn gather_scalar(data: &[Complex32], sc0: usize, bs_ant: usize, out: &mut [Complex32]) {
    debug_assert_eq!(sc0 % SCS_PER_CACHELINE, 0);
    let base = block_base(sc0, bs_ant);
    for j in 0..SCS_PER_CACHELINE {
        let sc = sc0 + j;
        for ant in 0..bs_ant {
            out[j * bs_ant + ant] = data[base + ant * TRANSPOSE_BLOCK_SIZE + sc % TRANSPOSE_BLOCK_SIZE];
        }
    }
}

/// Grouped implementation; antennas beyond the last full group use the
/// scalar loop
pub fn gather_grouped(data: &[Complex32], sc0: usize, bs_ant: usize, out: &mut [Complex32]) {
    debug_assert_eq!(sc0 % SCS_PER_CACHELINE, 0);
    let base = block_base(sc0, bs_ant) + sc0 % TRANSPOSE_BLOCK_SIZE;
    let grouped = bs_ant - bs_ant % ANTS_PER_GROUP;

    for ant in (0..grouped).step_by(ANTS_PER_GROUP) {
        let src = base + ant * TRANSPOSE_BLOCK_SIZE;
        for j in 0..SCS_PER_CACHELINE {
            let lanes: [Complex32; ANTS_PER_GROUP] = [
                data[src + j],
                data[src + j + TRANSPOSE_BLOCK_SIZE],
                data[src + j + 2 * TRANSPOSE_BLOCK_SIZE],
                data[src + j + 3 * TRANSPOSE_BLOCK_SIZE],
            ];
            out[j * bs_ant + ant..j * bs_ant + ant + ANTS_PER_GROUP].copy_from_slice(&lanes);
        }
    }

    for j in 0..SCS_PER_CACHELINE {
        for ant in grouped..bs_ant {
            out[j * bs_ant + ant] = data[base + ant * TRANSPOSE_BLOCK_SIZE + j];
        }
    }
}

/// Gather one cache line of subcarriers starting at `sc0`
pub fn gather(data: &[Complex32], sc0: usize, bs_ant: usize, out: &mut [Complex32]) {
    if bs_ant >= ANTS_PER_GROUP {
        gather_grouped(data, sc0, bs_ant, out);
    } else {
        gather_scalar(data, sc0, bs_ant, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn transposed_symbol(rng: &mut StdRng, data_num: usize, bs_ant: usize) -> Vec<Complex32> {
        (0..data_num * bs_ant)
            .map(|_| Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    #[test]
    fn test_grouped_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(42);
        for bs_ant in [1usize, 3, 4, 6, 8, 16, 18] {
            let data_num = 64;
            let data = transposed_symbol(&mut rng, data_num, bs_ant);
            for sc0 in (0..data_num).step_by(SCS_PER_CACHELINE) {
                let mut scalar = vec![Complex32::default(); SCS_PER_CACHELINE * bs_ant];
                let mut grouped = scalar.clone();
                gather_scalar(&data, sc0, bs_ant, &mut scalar);
                gather_grouped(&data, sc0, bs_ant, &mut grouped);
                assert_eq!(scalar, grouped, "bs_ant {} sc0 {}", bs_ant, sc0);
            }
        }
    }

    #[test]
    fn test_gather_inverts_partial_transpose() {
        let bs_ant = 4;
        let data_num = 32;
        // Value encodes (sc, ant)
        let mut data = vec![Complex32::default(); data_num * bs_ant];
        for sc in 0..data_num {
            for ant in 0..bs_ant {
                let idx = (sc / TRANSPOSE_BLOCK_SIZE) * TRANSPOSE_BLOCK_SIZE * bs_ant
                    + ant * TRANSPOSE_BLOCK_SIZE
                    + sc % TRANSPOSE_BLOCK_SIZE;
                data[idx] = Complex32::new(sc as f32, ant as f32);
            }
        }
        let mut out = vec![Complex32::default(); SCS_PER_CACHELINE * bs_ant];
        gather(&data, 24, bs_ant, &mut out);
        for j in 0..SCS_PER_CACHELINE {
            for ant in 0..bs_ant {
                assert_eq!(out[j * bs_ant + ant], Complex32::new((24 + j) as f32, ant as f32));
            }
        }
    }
}
