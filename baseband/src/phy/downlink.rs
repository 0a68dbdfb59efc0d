//! Terminal Downlink Receive
//!
//! Client pilot symbols build the channel estimate (`Y / pilot`, one partial
//! per pilot symbol). Data symbols are equalized with the averaged estimate,
//! common phase error is removed using the pilot tones, and EVM is recorded
//! for the frame's diagnostics.

use num_complex::Complex32;
use tracing::{trace, warn};

use common::{SymbolRole, WorkTag};

use super::modulation::demodulate_soft;
use super::ofdm::OfdmProcessor;
use super::StageContext;

/// Per-worker scratch of the downlink receiver
pub struct DownlinkReceiver {
    csi: Vec<Complex32>,
    tones: Vec<Complex32>,
}

/// Mean phase of `equalized * conj(reference)` over the given tones
pub fn common_phase_error(pairs: impl Iterator<Item = (Complex32, Complex32)>) -> f32 {
    let (sum, count) = pairs.fold((0.0f32, 0usize), |(sum, count), (eq, reference)| {
        (sum + (eq * reference.conj()).arg(), count + 1)
    });
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

impl DownlinkReceiver {
    pub fn new(data_num: usize) -> Self {
        Self {
            csi: vec![Complex32::default(); data_num],
            tones: Vec::with_capacity(data_num),
        }
    }

    /// FFT of one terminal antenna of a downlink symbol into its spectrum
    /// row. Returns the downlink symbol index.
    fn fft(ctx: &StageContext, ofdm: &mut OfdmProcessor, tag: WorkTag) -> Option<usize> {
        let config = ctx.config;
        let layout = &ctx.buffers.layout;
        let ant = tag.ant_id();
        if ant >= config.ue_ant_num {
            return None;
        }
        let dl_idx = config.frame.dl_symbol_idx(tag.symbol_id())?;
        let row = layout.dl_symbol_row(tag.frame_id(), dl_idx, ant);
        // SAFETY: received samples were written before the tag was queued;
        // this task is the only writer of the spectrum row
        unsafe {
            let rx = ctx.buffers.dl_rx.row(row);
            let spectrum = ofdm.demodulate(rx, config.ofdm_rx_zero_prefix + config.cp_len);
            ctx.buffers.dl_fft.row_mut(row).copy_from_slice(spectrum);
        }
        Some(dl_idx)
    }

    /// Accumulate `Y / pilot` of one client pilot symbol into its estimate partial
    pub fn fft_pilot(&mut self, ctx: &StageContext, ofdm: &mut OfdmProcessor, tag: WorkTag) -> bool {
        let config = ctx.config;
        if !config.frame.is_dl_client_pilot(tag.symbol_id()) {
            return false;
        }
        let Some(dl_idx) = Self::fft(ctx, ofdm, tag) else {
            return false;
        };
        let layout = &ctx.buffers.layout;
        let frame_id = tag.frame_id();
        let ant = tag.ant_id();
        trace!("DL pilot FFT frame {} symbol {} ant {}", frame_id, tag.symbol_id(), ant);

        let pilot = ctx.reference.pilot(ant);
        // SAFETY: one task per (pilot symbol, antenna) writes this partial,
        // after the slot was reset at admission
        unsafe {
            let spectrum = ctx.buffers.dl_fft.row(layout.dl_symbol_row(frame_id, dl_idx, ant));
            let csi = ctx.buffers.dl_csi.row_mut(layout.csi_row(frame_id, dl_idx, ant));
            let band = &spectrum[config.ofdm_data_start..config.ofdm_data_stop()];
            for ((acc, y), p) in csi.iter_mut().zip(band).zip(pilot) {
                *acc += y / p;
            }
        }
        true
    }

    /// Equalize one terminal antenna of a downlink data symbol
    pub fn fft_data(&mut self, ctx: &StageContext, ofdm: &mut OfdmProcessor, tag: WorkTag) -> bool {
        let config = ctx.config;
        let frame = &config.frame;
        let Some(data_idx) = frame.dl_data_symbol_idx(tag.symbol_id()) else {
            return false;
        };
        let Some(dl_idx) = Self::fft(ctx, ofdm, tag) else {
            return false;
        };
        let layout = &ctx.buffers.layout;
        let frame_id = tag.frame_id();
        let ant = tag.ant_id();
        let pilots = layout.client_dl_pilot_syms;
        trace!("DL data FFT frame {} symbol {} ant {}", frame_id, tag.symbol_id(), ant);

        // SAFETY: every pilot FFT of the frame completed before data FFTs
        // were queued; the equalized row belongs to this task
        let (spectrum, equal) = unsafe {
            self.csi.fill(Complex32::default());
            for pilot in 0..pilots {
                let partial = ctx.buffers.dl_csi.row(layout.csi_row(frame_id, pilot, ant));
                for (acc, v) in self.csi.iter_mut().zip(partial) {
                    *acc += v;
                }
            }
            (
                ctx.buffers.dl_fft.row(layout.dl_symbol_row(frame_id, dl_idx, ant)),
                ctx.buffers.dl_equal.row_mut(layout.dl_data_row(frame_id, data_idx, ant)),
            )
        };
        let scale = 1.0 / pilots.max(1) as f32;
        let band = &spectrum[config.ofdm_data_start..config.ofdm_data_stop()];
        for ((eq, y), csi) in equal.iter_mut().zip(band).zip(&self.csi) {
            let h = csi * scale;
            *eq = if h.norm_sqr() > 0.0 { y / h } else { Complex32::default() };
        }

        let pilot = ctx.reference.pilot(ant);
        let theta = common_phase_error(
            (0..config.ofdm_data_num)
                .filter(|sc| config.is_pilot_tone(*sc))
                .map(|sc| (equal[sc], pilot[sc])),
        );
        let rotation = Complex32::from_polar(1.0, -theta);

        let reference = ctx.reference.dl_iq(data_idx, ant);
        let mut error = 0.0f32;
        for (sc, eq) in equal.iter_mut().enumerate() {
            if config.is_pilot_tone(sc) {
                *eq = Complex32::default();
            } else {
                *eq *= rotation;
                error += (*eq - reference[sc]).norm_sqr();
            }
        }
        let evm = (error / config.dl_data_tone_num() as f32).sqrt();
        // SAFETY: one task per (data symbol, antenna) writes this element
        unsafe {
            ctx.buffers
                .dl_evm
                .write(layout.dl_evm_row(frame_id, data_idx), ant, evm);
        }
        true
    }

    /// Soft-demodulate the data tones of one antenna of a downlink data symbol
    pub fn demodulate(&mut self, ctx: &StageContext, tag: WorkTag) -> bool {
        let config = ctx.config;
        if config.frame.role(tag.symbol_id()) != Some(SymbolRole::Downlink) || tag.ant_id() >= config.ue_ant_num {
            return false;
        }
        let Some(data_idx) = config.frame.dl_data_symbol_idx(tag.symbol_id()) else {
            return false;
        };
        let frame_id = tag.frame_id();
        let row = ctx.buffers.layout.dl_data_row(frame_id, data_idx, tag.ant_id());

        self.tones.clear();
        // SAFETY: equalization of the symbol completed; the soft-bit row
        // belongs to this task
        let llr = unsafe {
            let equal = ctx.buffers.dl_equal.row(row);
            self.tones.extend(
                equal
                    .iter()
                    .enumerate()
                    .filter(|(sc, _)| !config.is_pilot_tone(*sc))
                    .map(|(_, v)| *v),
            );
            ctx.buffers.dl_demod.row_mut(row)
        };
        if !demodulate_soft(config.modulation, &self.tones, llr) {
            warn!(
                "Soft demodulation of {} is not supported, frame {} symbol {} left empty",
                config.modulation.name(),
                frame_id,
                tag.symbol_id()
            );
        }
        true
    }
}
