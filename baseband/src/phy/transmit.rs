//! Uplink Transmit Chain
//!
//! Modulate maps encoded bits of one UE onto the data subcarriers;
//! InverseFft turns each channel's frequency-domain symbol into
//! cyclic-prefixed `i16` samples. Client pilot symbols carry the known pilot.

use num_complex::Complex32;
use tracing::trace;

use common::{SymbolRole, WorkTag};

use super::modulation::ModulationTable;
use super::ofdm::OfdmProcessor;
use super::StageContext;

/// Map a one-bit-per-byte stream onto `out`, `bits_per_symbol` bits per
/// point, first bit in the MSB. Missing trailing bits read as zero.
pub fn map_encoded_bits(table: &ModulationTable, encoded: &[u8], out: &mut [Complex32]) {
    let m = table.bits_per_symbol();
    for (i, point) in out.iter_mut().enumerate() {
        let index = (0..m).fold(0u8, |acc, k| {
            (acc << 1) | (encoded.get(i * m + k).copied().unwrap_or(0) & 1)
        });
        *point = table.map(index);
    }
}

fn uplink_data_symbol(ctx: &StageContext, tag: WorkTag) -> Option<usize> {
    let frame = &ctx.config.frame;
    match frame.role(tag.symbol_id()) {
        Some(SymbolRole::Uplink) => frame.ul_data_symbol_idx(tag.symbol_id()),
        _ => None,
    }
}

/// Modulate every channel of one UE for one uplink data symbol
pub fn modulate(ctx: &StageContext, table: &ModulationTable, tag: WorkTag) -> bool {
    let Some(data_idx) = uplink_data_symbol(ctx, tag) else {
        return false;
    };
    let config = ctx.config;
    if tag.ue_id() >= config.ue_num {
        return false;
    }
    let layout = &ctx.buffers.layout;
    let frame_id = tag.frame_id();

    for ch in 0..config.num_channels {
        let ant = tag.ue_id() * config.num_channels + ch;
        let row = layout.ul_data_row(frame_id, data_idx, ant);
        trace!("Modulate frame {} symbol {} ant {}", frame_id, tag.symbol_id(), ant);
        // SAFETY: encode for this (symbol, UE) completed; only this task
        // writes the modulated row
        unsafe {
            let encoded = ctx.buffers.ul_encoded.row(row);
            map_encoded_bits(table, encoded, ctx.buffers.ul_modul.row_mut(row));
        }
    }
    true
}

/// Inverse FFT of every channel of one UE for one uplink symbol
pub fn inverse_fft(ctx: &StageContext, ofdm: &mut OfdmProcessor, tag: WorkTag) -> bool {
    let config = ctx.config;
    let frame = &config.frame;
    let symbol_id = tag.symbol_id();
    if frame.role(symbol_id) != Some(SymbolRole::Uplink) || tag.ue_id() >= config.ue_num {
        return false;
    }
    let Some(ul_idx) = frame.ul_symbol_idx(symbol_id) else {
        return false;
    };
    let layout = &ctx.buffers.layout;
    let frame_id = tag.frame_id();
    let data_idx = frame.ul_data_symbol_idx(symbol_id);

    for ch in 0..config.num_channels {
        let ant = tag.ue_id() * config.num_channels + ch;
        trace!("IFFT frame {} symbol {} ant {}", frame_id, symbol_id, ant);
        // SAFETY: modulation of this (symbol, UE) completed; only this task
        // writes the transmit row
        unsafe {
            let band = match data_idx {
                Some(d) => ctx.buffers.ul_modul.row(layout.ul_data_row(frame_id, d, ant)),
                None => ctx.reference.pilot(ant),
            };
            ofdm.modulate_band(
                band,
                config.ofdm_data_start,
                ctx.buffers.ul_tx.row_mut(layout.ul_tx_row(frame_id, ul_idx, ant)),
                config.ofdm_tx_zero_prefix,
                config.cp_len,
                config.tx_scale,
            );
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::test_support::Fixture;
    use common::ModulationScheme;
    use num_complex::Complex;

    #[test]
    fn test_map_encoded_bits_pads_with_zero() {
        let table = ModulationTable::new(ModulationScheme::Qam16);
        let mut out = vec![Complex32::default(); 3];
        map_encoded_bits(&table, &[1, 0, 1, 1, 0, 1], &mut out);
        assert_eq!(out[0], table.map(0b1011));
        assert_eq!(out[1], table.map(0b0100));
        assert_eq!(out[2], table.map(0));
    }

    #[test]
    fn test_pilot_symbol_transmits_pilot() {
        let fx = Fixture::new(Fixture::small_params());
        let config = &fx.config;
        let ctx = fx.ctx();
        let mut ofdm = OfdmProcessor::new(config.ofdm_ca_num);
        let symbol = config.frame.ul_symbol(0);
        assert!(inverse_fft(&ctx, &mut ofdm, WorkTag::frm_sym_ue(2, symbol, 1)));

        let tx = unsafe { fx.buffers.ul_tx.row(fx.buffers.layout.ul_tx_row(2, 0, 1)) }.to_vec();
        let mut rx_ofdm = OfdmProcessor::new(config.ofdm_ca_num);
        let spectrum = rx_ofdm.demodulate(&tx, config.cp_len);
        let gain = config.ofdm_ca_num as f32 * config.tx_scale;
        for (sc, pilot) in fx.reference.pilot(1).iter().enumerate() {
            let got = spectrum[config.ofdm_data_start + sc] / gain;
            assert!((got - pilot).norm() < 1e-2);
        }
        assert!(spectrum[0].norm() / gain < 1e-2);
        assert!(tx.iter().any(|s| *s != Complex::new(0, 0)));
    }

    #[test]
    fn test_transmit_stages_reject_other_roles() {
        let fx = Fixture::new(Fixture::small_params());
        let ctx = fx.ctx();
        let table = ModulationTable::new(fx.config.modulation);
        let dl_symbol = fx.config.frame.dl_symbol(1);
        assert!(!modulate(&ctx, &table, WorkTag::frm_sym_ue(0, dl_symbol, 0)));
        // Client pilot symbols carry no modulated data
        assert!(!modulate(&ctx, &table, WorkTag::frm_sym_ue(0, fx.config.frame.ul_symbol(0), 0)));
    }

    #[test]
    fn test_transmit_stages_reject_unknown_ue() {
        let fx = Fixture::new(Fixture::small_params());
        let config = &fx.config;
        let ctx = fx.ctx();
        let table = ModulationTable::new(config.modulation);
        let mut ofdm = OfdmProcessor::new(config.ofdm_ca_num);
        let data = config.frame.ul_symbol(config.frame.client_ul_pilot_symbols());
        let ue = config.ue_num;

        assert!(!modulate(&ctx, &table, WorkTag::frm_sym_ue(0, data, ue)));
        assert!(!inverse_fft(&ctx, &mut ofdm, WorkTag::frm_sym_ue(0, config.frame.ul_symbol(0), ue)));
        assert!(!inverse_fft(&ctx, &mut ofdm, WorkTag::frm_sym_ue(0, data, ue)));
        // Nothing spilled into the rows of the next symbol
        for row in 0..fx.buffers.ul_tx.rows() {
            assert!(unsafe { fx.buffers.ul_tx.row(row) }.iter().all(|s| *s == Complex::new(0, 0)));
        }
        for row in 0..fx.buffers.ul_modul.rows() {
            assert!(unsafe { fx.buffers.ul_modul.row(row) }.iter().all(|s| *s == Complex32::default()));
        }
    }
}
