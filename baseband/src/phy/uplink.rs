//! Uplink Equalization and Soft Demodulation
//!
//! One task covers `demul_block_size` subcarriers of one uplink symbol for
//! all UEs: gather across antennas, zero-forcing equalization, pilot phase
//! tracking, transpose to UE-major order and soft demodulation.

use ndarray::linalg::general_mat_vec_mul;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1};
use num_complex::Complex32;
use std::time::Instant;
use tracing::{trace, warn};

use common::{Config, SymbolRole, WorkTag, SCS_PER_CACHELINE};
use interfaces::DurationStat;

use super::gather::gather;
use super::modulation::demodulate_soft;
use super::{wrap_phase, StageContext};

/// Unit-magnitude direction of `z`, zero for zero input
fn complex_sign(z: Complex32) -> Complex32 {
    let norm = z.norm();
    if norm > 0.0 {
        z / norm
    } else {
        Complex32::default()
    }
}

/// Common phase to remove from uplink symbol `ul_symbol_idx`.
///
/// `pilot_sums` holds one accumulated `sign(eq * conj(pilot))` per client
/// pilot symbol, in symbol order. The phase is extrapolated linearly from
/// the first pilot using the mean pilot-to-pilot increment.
pub fn phase_correction(pilot_sums: &[Complex32], ul_symbol_idx: usize) -> f32 {
    let Some(first) = pilot_sums.first() else {
        return 0.0;
    };
    let theta0 = first.arg();
    let increments = pilot_sums.len().saturating_sub(1);
    let inc = if increments == 0 {
        0.0
    } else {
        pilot_sums
            .windows(2)
            .map(|w| wrap_phase(w[1].arg() - w[0].arg()))
            .sum::<f32>()
            / increments as f32
    };
    theta0 + ul_symbol_idx as f32 * inc
}

/// Per-worker scratch of the uplink demodulator
pub struct Demodulator {
    gathered: Vec<Complex32>,
    equaled: Vec<Complex32>,
    transposed: Vec<Complex32>,
    phase_acc: Vec<Complex32>,
    evm_acc: Vec<f32>,
    correction: Vec<Complex32>,
    pilot_sums: Vec<Complex32>,
}

impl Demodulator {
    pub fn new(config: &Config) -> Self {
        let block = config.demul_block_size;
        let ue = config.ue_ant_num;
        Self {
            gathered: vec![Complex32::default(); SCS_PER_CACHELINE * config.bs_ant_num],
            equaled: vec![Complex32::default(); block * ue],
            transposed: vec![Complex32::default(); block * ue],
            phase_acc: vec![Complex32::default(); ue],
            evm_acc: vec![0.0; ue],
            correction: vec![Complex32::new(1.0, 0.0); ue],
            pilot_sums: vec![Complex32::default(); config.frame.client_ul_pilot_symbols()],
        }
    }

    /// Sum the per-block phase partials of every client pilot symbol of
    /// `frame_id` for one UE.
    ///
    /// # Safety
    /// All pilot demodulation tasks of the frame must have completed.
    unsafe fn collect_pilot_sums(&mut self, ctx: &StageContext, frame_id: u64, ue: usize) {
        let layout = &ctx.buffers.layout;
        for (pilot, sum) in self.pilot_sums.iter_mut().enumerate() {
            *sum = (0..layout.demul_blocks)
                .map(|block| ctx.buffers.ul_phase.read(layout.phase_row(frame_id, pilot, block), ue))
                .sum();
        }
    }

    /// Run one demodulation task. `tag` carries the first subcarrier of the
    /// block. Returns false if the symbol is not an uplink symbol or the
    /// subcarrier does not start a block.
    pub fn launch(&mut self, ctx: &StageContext, tag: WorkTag, stat: &mut DurationStat) -> bool {
        let config = ctx.config;
        let buffers = ctx.buffers;
        let layout = &buffers.layout;
        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let base_sc = tag.sc_id();

        if config.frame.role(symbol_id) != Some(SymbolRole::Uplink)
            || base_sc >= config.ofdm_data_num
            || base_sc % config.demul_block_size != 0
            || tag.unit_id() != 0
        {
            return false;
        }
        let Some(ul_idx) = config.frame.ul_symbol_idx(symbol_id) else {
            return false;
        };
        let bs = config.bs_ant_num;
        let ue_num = config.ue_ant_num;
        let block = base_sc / config.demul_block_size;
        let max_sc = config.demul_block_size.min(config.ofdm_data_num - base_sc);
        let is_pilot = config.frame.is_ul_client_pilot(symbol_id);
        let data_idx = config.frame.ul_data_symbol_idx(symbol_id);
        let num_pilots = layout.client_ul_pilot_syms;

        trace!(
            "Demodulate frame {} symbol {} subcarriers {}..{}",
            frame_id,
            symbol_id,
            base_sc,
            base_sc + max_sc
        );

        // Phase correction for data symbols is fixed per task
        self.correction.fill(Complex32::new(1.0, 0.0));
        if !is_pilot && num_pilots > 0 {
            for ue in 0..ue_num {
                // SAFETY: pilot tasks finished before data tasks were queued
                unsafe { self.collect_pilot_sums(ctx, frame_id, ue) };
                let theta = phase_correction(&self.pilot_sums, ul_idx);
                self.correction[ue] = Complex32::from_polar(1.0, -theta);
            }
        }
        self.phase_acc.fill(Complex32::default());
        self.evm_acc.fill(0.0);

        let Demodulator {
            gathered,
            equaled,
            transposed,
            phase_acc,
            evm_acc,
            correction,
            ..
        } = self;

        // SAFETY: each demodulation task owns its subcarrier range in the
        // exported constellation and soft-bit rows; the spectrum and ZF rows
        // were completed by earlier stages
        let equal_out: &mut [Complex32] = if config.export_constellation {
            unsafe {
                buffers.ul_equal.range_mut(
                    layout.ul_equal_row(frame_id, ul_idx),
                    base_sc * ue_num,
                    max_sc * ue_num,
                )
            }
        } else {
            &mut equaled[..max_sc * ue_num]
        };
        let spectrum = unsafe { buffers.ul_fft.row(layout.ul_fft_row(frame_id, ul_idx)) };

        for group in (0..max_sc).step_by(SCS_PER_CACHELINE) {
            let t0 = Instant::now();
            gather(spectrum, base_sc + group, bs, gathered);
            let t1 = Instant::now();
            stat.task_duration[1] += t1 - t0;

            for j in 0..SCS_PER_CACHELINE {
                let sc = base_sc + group + j;
                let zf = unsafe { buffers.ul_zf.row(layout.zf_row(frame_id, config.zf_sc_id(sc))) };
                let (Ok(zf), Ok(y)) = (
                    ArrayView2::from_shape((ue_num, bs), zf),
                    ArrayView1::from_shape(bs, &gathered[j * bs..(j + 1) * bs]),
                ) else {
                    warn!("ZF matrix shape mismatch at subcarrier {}", sc);
                    return false;
                };
                let out_slice = &mut equal_out[(group + j) * ue_num..(group + j + 1) * ue_num];
                let mut out = ArrayViewMut1::from(&mut *out_slice);
                general_mat_vec_mul(Complex32::new(1.0, 0.0), &zf, &y, Complex32::default(), &mut out);

                for (ue, eq) in out_slice.iter_mut().enumerate() {
                    if is_pilot {
                        let pilot = ctx.reference.pilot(ue)[sc];
                        phase_acc[ue] += complex_sign(*eq * pilot.conj());
                    } else {
                        *eq *= correction[ue];
                        if data_idx == Some(0) {
                            evm_acc[ue] += (*eq - ctx.reference.ul_iq(0, ue)[sc]).norm_sqr();
                        }
                    }
                }
            }
            stat.task_duration[2] += t1.elapsed();
        }

        if is_pilot {
            let row = layout.phase_row(frame_id, ul_idx, block);
            for (ue, acc) in phase_acc.iter().enumerate() {
                // SAFETY: one task per (pilot symbol, block) writes this row
                unsafe {
                    let prev = buffers.ul_phase.read(row, ue);
                    buffers.ul_phase.write(row, ue, prev + *acc);
                }
            }
        } else if data_idx == Some(0) {
            // SAFETY: one task per block of the first data symbol writes
            // this row
            unsafe {
                buffers
                    .ul_evm
                    .row_mut(layout.ul_evm_row(frame_id, block))
                    .copy_from_slice(&evm_acc[..]);
            }
        }

        let t2 = Instant::now();
        for j in 0..max_sc {
            for ue in 0..ue_num {
                transposed[ue * max_sc + j] = equal_out[j * ue_num + ue];
            }
        }
        let mod_bits = config.modulation.bits_per_symbol();
        for ue in 0..ue_num {
            let llr = unsafe {
                buffers.ul_demod.range_mut(
                    layout.ul_demod_row(frame_id, ul_idx, ue),
                    mod_bits * base_sc,
                    mod_bits * max_sc,
                )
            };
            if !demodulate_soft(config.modulation, &transposed[ue * max_sc..(ue + 1) * max_sc], llr) {
                warn!(
                    "Soft demodulation of {} is not supported, frame {} symbol {} left empty",
                    config.modulation.name(),
                    frame_id,
                    symbol_id
                );
                break;
            }
        }
        stat.task_duration[3] += t2.elapsed();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::modulation::hard_decision;
    use crate::phy::test_support::Fixture;
    use common::ConfigParams;
    use std::f32::consts::PI;

    /// Orthonormal-column channel `H[a][u]`, so `H^H` is its pseudo-inverse
    fn channel(bs: usize, ue: usize) -> Vec<Complex32> {
        let mut h = vec![Complex32::default(); bs * ue];
        for a in 0..bs {
            for u in 0..ue {
                h[a * ue + u] =
                    Complex32::from_polar(1.0 / (bs as f32).sqrt(), -2.0 * PI * (a * u) as f32 / bs as f32);
            }
        }
        h
    }

    /// Write ZF = H^H for every subcarrier and `y = H x e^{j phase}` into
    /// uplink symbol `ul_idx`
    fn load_symbol(fx: &Fixture, frame: u64, ul_idx: usize, x: &[Vec<Complex32>], phase: f32) {
        let config = &fx.config;
        let layout = &fx.buffers.layout;
        let (bs, ue) = (config.bs_ant_num, config.ue_ant_num);
        let h = channel(bs, ue);
        let rot = Complex32::from_polar(1.0, phase);
        unsafe {
            for sc in 0..config.ofdm_data_num {
                let zf = fx.buffers.ul_zf.row_mut(layout.zf_row(frame, sc));
                for u in 0..ue {
                    for a in 0..bs {
                        zf[u * bs + a] = h[a * ue + u].conj();
                    }
                }
                for a in 0..bs {
                    let y: Complex32 = (0..ue).map(|u| h[a * ue + u] * x[u][sc]).sum();
                    fx.buffers.ul_fft.write(
                        layout.ul_fft_row(frame, ul_idx),
                        layout.transposed_index(sc, a),
                        y * rot,
                    );
                }
            }
        }
    }

    fn demodulate_symbol(fx: &Fixture, demod: &mut Demodulator, frame: u64, symbol_id: usize) {
        let mut stat = DurationStat::default();
        for base in (0..fx.config.ofdm_data_num).step_by(fx.config.demul_block_size) {
            assert!(demod.launch(&fx.ctx(), WorkTag::frm_sym_sc(frame, symbol_id, base), &mut stat));
        }
    }

    fn exported(fx: &Fixture, frame: u64, ul_idx: usize, sc: usize, ue: usize) -> Complex32 {
        let row = fx.buffers.layout.ul_equal_row(frame, ul_idx);
        unsafe { fx.buffers.ul_equal.read(row, sc * fx.config.ue_ant_num + ue) }
    }

    #[test]
    fn test_equalization_recovers_transmitted_symbols() {
        let fx = Fixture::new(ConfigParams {
            frame: "PUU".to_string(),
            client_ul_pilot_symbols: 0,
            client_dl_pilot_symbols: 0,
            export_constellation: true,
            ..Fixture::small_params()
        });
        let ue = fx.config.ue_ant_num;
        let x: Vec<Vec<Complex32>> = (0..ue).map(|u| fx.reference.ul_iq(0, u).to_vec()).collect();
        load_symbol(&fx, 5, 0, &x, 0.0);

        let mut demod = Demodulator::new(&fx.config);
        demodulate_symbol(&fx, &mut demod, 5, fx.config.frame.ul_symbol(0));

        for sc in 0..fx.config.ofdm_data_num {
            for u in 0..ue {
                let err = (exported(&fx, 5, 0, sc, u) - x[u][sc]).norm();
                assert!(err < 1e-5, "sc {} ue {} err {}", sc, u, err);
            }
        }
        // Noiseless first data symbol has no error
        unsafe { fx.buffers.report_diagnostics(5, &fx.stats) };
        assert!(fx.stats.ul_evm(5).iter().all(|e| *e < 1e-8));
    }

    #[test]
    fn test_phase_correction_extrapolates_linear_drift() {
        let theta = 0.3f32;
        let inc = 0.05f32;
        let sums: Vec<Complex32> = (0..3)
            .map(|p| Complex32::from_polar(7.0, theta + p as f32 * inc))
            .collect();
        assert!((phase_correction(&sums, 0) - theta).abs() < 1e-5);
        assert!((phase_correction(&sums, 5) - (theta + 5.0 * inc)).abs() < 1e-5);
        assert_eq!(phase_correction(&[], 4), 0.0);
    }

    #[test]
    fn test_pilot_phase_offset_is_removed_from_data() {
        let fx = Fixture::new(ConfigParams {
            frame: "PUUUU".to_string(),
            client_ul_pilot_symbols: 2,
            client_dl_pilot_symbols: 0,
            export_constellation: true,
            ..Fixture::small_params()
        });
        let config = &fx.config;
        let ue = config.ue_ant_num;
        let frame = 3;
        let offset = 0.4f32;
        let mut demod = Demodulator::new(config);

        // Stale residue from an older occupant of the slot must not leak
        unsafe {
            let row = fx.buffers.layout.phase_row(frame, 0, 0);
            fx.buffers.ul_phase.write(row, 0, Complex32::new(-50.0, 3.0));
            fx.buffers.reset_accumulators(frame);
        }

        for pilot in 0..2 {
            let x: Vec<Vec<Complex32>> = (0..ue).map(|u| fx.reference.pilot(u).to_vec()).collect();
            load_symbol(&fx, frame, pilot, &x, offset);
            demodulate_symbol(&fx, &mut demod, frame, config.frame.ul_symbol(pilot));
        }

        let mut sums = vec![Complex32::default(); 2];
        for (pilot, sum) in sums.iter_mut().enumerate() {
            *sum = (0..fx.buffers.layout.demul_blocks)
                .map(|b| unsafe { fx.buffers.ul_phase.read(fx.buffers.layout.phase_row(frame, pilot, b), 1) })
                .sum();
        }
        assert!((-phase_correction(&sums, 2) + offset).abs() < 0.01);

        let x: Vec<Vec<Complex32>> = (0..ue).map(|u| fx.reference.ul_iq(0, u).to_vec()).collect();
        load_symbol(&fx, frame, 2, &x, offset);
        demodulate_symbol(&fx, &mut demod, frame, config.frame.ul_symbol(2));
        for sc in (0..config.ofdm_data_num).step_by(7) {
            for u in 0..ue {
                assert!((exported(&fx, frame, 2, sc, u) - x[u][sc]).norm() < 1e-3);
            }
        }
    }

    #[test]
    fn test_linear_phase_drift_leaves_soft_bits_exact() {
        let fx = Fixture::new(ConfigParams {
            frame: "PUUUU".to_string(),
            client_ul_pilot_symbols: 2,
            client_dl_pilot_symbols: 0,
            modulation: "16QAM".to_string(),
            ..Fixture::small_params()
        });
        let config = &fx.config;
        let layout = &fx.buffers.layout;
        let ue = config.ue_ant_num;
        let mod_bits = config.modulation.bits_per_symbol();
        let frame = 2;
        // Rotation reaches 1.25 rad by the last symbol, past every decision
        // boundary of the constellation
        let (theta0, drift) = (0.2f32, 0.35f32);
        let mut demod = Demodulator::new(config);
        unsafe { fx.buffers.reset_accumulators(frame) };

        for pilot in 0..2 {
            let x: Vec<Vec<Complex32>> = (0..ue).map(|u| fx.reference.pilot(u).to_vec()).collect();
            load_symbol(&fx, frame, pilot, &x, theta0 + pilot as f32 * drift);
            demodulate_symbol(&fx, &mut demod, frame, config.frame.ul_symbol(pilot));
        }

        for ul_idx in 2..4 {
            let data = config.frame.ul_data_symbol_idx(config.frame.ul_symbol(ul_idx)).unwrap();
            let x: Vec<Vec<Complex32>> = (0..ue).map(|u| fx.reference.ul_iq(data, u).to_vec()).collect();
            load_symbol(&fx, frame, ul_idx, &x, theta0 + ul_idx as f32 * drift);
            demodulate_symbol(&fx, &mut demod, frame, config.frame.ul_symbol(ul_idx));

            for (u, sent) in x.iter().enumerate() {
                let mut reference_llr = vec![0i8; config.ofdm_data_num * mod_bits];
                assert!(demodulate_soft(config.modulation, sent, &mut reference_llr));
                let mut expected = vec![0u8; reference_llr.len()];
                hard_decision(&reference_llr, &mut expected);

                let llr = unsafe { fx.buffers.ul_demod.row(layout.ul_demod_row(frame, ul_idx, u)) };
                let mut bits = vec![0u8; llr.len()];
                hard_decision(llr, &mut bits);
                assert_eq!(bits, expected, "symbol {} ue {}", ul_idx, u);
            }
        }
    }

    #[test]
    fn test_non_uplink_symbol_is_rejected() {
        let fx = Fixture::new(Fixture::small_params());
        let mut demod = Demodulator::new(&fx.config);
        let mut stat = DurationStat::default();
        assert!(!demod.launch(&fx.ctx(), WorkTag::frm_sym_sc(0, 0, 0), &mut stat));

        // Subcarriers must start a block
        let ul = fx.config.frame.ul_symbol(fx.config.frame.client_ul_pilot_symbols());
        assert!(!demod.launch(&fx.ctx(), WorkTag::frm_sym_sc(0, ul, 8), &mut stat));
        assert!(!demod.launch(&fx.ctx(), WorkTag::frm_sym_sc(0, ul, fx.config.ofdm_data_num), &mut stat));
    }
}
