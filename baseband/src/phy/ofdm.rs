//! OFDM Modulation and Demodulation
//!
//! Time-domain symbols are `i16` IQ laid out as
//! `[zero prefix][cyclic prefix][FFT window][zero postfix]`. Both transforms
//! are unnormalized; the transmit scale is applied before conversion.

use num_complex::{Complex, Complex32};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::trace;

use common::{cf32_from_ci16, ci16_from_cf32, EventType, SymbolRole, WorkTag};

use super::StageContext;

/// Per-worker FFT plans and scratch
pub struct OfdmProcessor {
    fft_size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl OfdmProcessor {
    pub fn new(fft_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            fft_size,
            forward,
            inverse,
            buffer: vec![Complex32::default(); fft_size],
            scratch: vec![Complex32::default(); scratch_len],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Forward FFT of the window starting `offset` samples into `rx`
    pub fn demodulate(&mut self, rx: &[Complex<i16>], offset: usize) -> &[Complex32] {
        for (dst, src) in self.buffer.iter_mut().zip(&rx[offset..offset + self.fft_size]) {
            *dst = cf32_from_ci16(*src);
        }
        self.forward.process_with_scratch(&mut self.buffer, &mut self.scratch);
        &self.buffer
    }

    /// Place `band` at `data_start`, zero the guard subcarriers, inverse
    /// transform and pack into `tx` with prefixes
    pub fn modulate_band(
        &mut self,
        band: &[Complex32],
        data_start: usize,
        tx: &mut [Complex<i16>],
        zero_prefix: usize,
        cp_len: usize,
        scale: f32,
    ) {
        self.buffer.fill(Complex32::default());
        self.buffer[data_start..data_start + band.len()].copy_from_slice(band);
        self.inverse.process_with_scratch(&mut self.buffer, &mut self.scratch);

        tx.fill(Complex::new(0, 0));
        let n = self.fft_size;
        let body = zero_prefix + cp_len;
        for (i, sample) in self.buffer.iter().enumerate() {
            tx[body + i] = ci16_from_cf32(sample * scale);
        }
        for i in 0..cp_len {
            tx[zero_prefix + i] = tx[body + n - cp_len + i];
        }
    }
}

/// Base-station FFT of one antenna of a pilot (`P`) or uplink (`U`) symbol.
///
/// The data band is stored in the partial-transpose layout of the pilot or
/// uplink spectrum table.
pub fn fft_uplink(ctx: &StageContext, ofdm: &mut OfdmProcessor, event_type: EventType, tag: WorkTag) -> bool {
    let config = ctx.config;
    let buffers = ctx.buffers;
    let layout = &buffers.layout;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let ant = tag.ant_id();
    if ant >= config.bs_ant_num {
        return false;
    }

    let (rx_idx, table, row) = match (event_type, config.frame.role(symbol_id)) {
        (EventType::FftPilot, Some(SymbolRole::Pilot)) => {
            let Some(pilot_idx) = config.frame.pilot_idx(symbol_id) else {
                return false;
            };
            (pilot_idx, &buffers.pilot_fft, layout.pilot_fft_row(frame_id, pilot_idx))
        }
        (EventType::FftData, Some(SymbolRole::Uplink)) => {
            let Some(ul_idx) = config.frame.ul_symbol_idx(symbol_id) else {
                return false;
            };
            (
                layout.num_pilot_syms + ul_idx,
                &buffers.ul_fft,
                layout.ul_fft_row(frame_id, ul_idx),
            )
        }
        _ => return false,
    };

    trace!("FFT uplink frame {} symbol {} ant {}", frame_id, symbol_id, ant);

    // SAFETY: the rx row was filled before this tag was enqueued, and each
    // antenna writes only its own elements of the transposed row
    unsafe {
        let rx = buffers.bs_rx.row(layout.bs_rx_row(frame_id, rx_idx, ant));
        let spectrum = ofdm.demodulate(rx, config.ofdm_rx_zero_prefix + config.cp_len);
        let band = &spectrum[config.ofdm_data_start..config.ofdm_data_stop()];
        for (sc, value) in band.iter().enumerate() {
            table.write(row, layout.transposed_index(sc, ant), *value);
        }
    }
    true
}
