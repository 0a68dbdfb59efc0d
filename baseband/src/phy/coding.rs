//! Encode and Decode Stages
//!
//! Thin launchers around the FEC collaborator. Encode covers every code
//! block of one UE's symbol; decode runs and completes once per code block.

use tracing::trace;

use common::{SymbolRole, WorkTag};
use interfaces::{Decoder, Encoder};

use super::StageContext;

/// Encode every channel of one UE for one uplink data symbol
pub fn encode(ctx: &StageContext, encoder: &mut dyn Encoder, tag: WorkTag) -> bool {
    let config = ctx.config;
    let frame = &config.frame;
    if frame.role(tag.symbol_id()) != Some(SymbolRole::Uplink) {
        return false;
    }
    let Some(data_idx) = frame.ul_data_symbol_idx(tag.symbol_id()) else {
        return false;
    };
    if tag.ue_id() >= config.ue_num {
        return false;
    }
    let layout = &ctx.buffers.layout;
    let code = &config.ul_code;
    let frame_id = tag.frame_id();

    for ch in 0..config.num_channels {
        let ant = tag.ue_id() * config.num_channels + ch;
        let row = layout.ul_data_row(frame_id, data_idx, ant);
        // SAFETY: the information bits were written before the tag was
        // queued; only this task writes the encoded row
        let (bits, encoded) = unsafe { (ctx.buffers.ul_bits.row(row), ctx.buffers.ul_encoded.row_mut(row)) };
        for cb in 0..code.blocks_per_symbol {
            trace!("Encode frame {} symbol {} ant {} cb {}", frame_id, tag.symbol_id(), ant, cb);
            encoder.encode(
                &bits[cb * code.info_bytes()..(cb + 1) * code.info_bytes()],
                &mut encoded[cb * code.encoded_bits..(cb + 1) * code.encoded_bits],
            );
        }
    }
    true
}

/// Decode code block `cb_id` of one antenna of an uplink or downlink data
/// symbol
pub fn decode(ctx: &StageContext, decoder: &mut dyn Decoder, tag: WorkTag) -> bool {
    let config = ctx.config;
    let frame = &config.frame;
    let layout = &ctx.buffers.layout;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let ant = tag.ant_id();
    let cb = tag.cb_id();
    if ant >= config.ue_ant_num {
        return false;
    }

    let (code, table, llr_table, llr_row, row) = match frame.role(symbol_id) {
        Some(SymbolRole::Uplink) => {
            let (Some(ul_idx), Some(data_idx)) =
                (frame.ul_symbol_idx(symbol_id), frame.ul_data_symbol_idx(symbol_id))
            else {
                return false;
            };
            (
                &config.ul_code,
                &ctx.buffers.ul_decoded,
                &ctx.buffers.ul_demod,
                layout.ul_demod_row(frame_id, ul_idx, ant),
                layout.ul_data_row(frame_id, data_idx, ant),
            )
        }
        Some(SymbolRole::Downlink) => {
            let Some(data_idx) = frame.dl_data_symbol_idx(symbol_id) else {
                return false;
            };
            let row = layout.dl_data_row(frame_id, data_idx, ant);
            (&config.dl_code, &ctx.buffers.dl_decoded, &ctx.buffers.dl_demod, row, row)
        }
        _ => return false,
    };
    if cb >= code.blocks_per_symbol {
        return false;
    }

    trace!("Decode frame {} symbol {} ant {} cb {}", frame_id, symbol_id, ant, cb);
    // SAFETY: demodulation of the symbol completed; only this task writes
    // the bytes of code block `cb`
    unsafe {
        let llr = &llr_table.row(llr_row)[cb * code.encoded_bits..(cb + 1) * code.encoded_bits];
        let decoded = table.range_mut(row, cb * code.info_bytes(), code.info_bytes());
        decoder.decode(llr, decoded);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::modulation::LLR_GAIN;
    use crate::phy::test_support::Fixture;
    use common::ConfigParams;
    use interfaces::{CodecFactory, RepetitionCodec};

    #[test]
    fn test_encode_then_decode_per_code_block() {
        let fx = Fixture::new(ConfigParams {
            code_blocks_per_symbol: 2,
            num_channels: 2,
            ue_num: 1,
            ..Fixture::small_params()
        });
        let config = &fx.config;
        let layout = &fx.buffers.layout;
        let codec = RepetitionCodec::new(config.fec_repetition).unwrap();
        let ctx = fx.ctx();
        let frame_id = 6;
        let symbol = config.frame.ul_symbol(config.frame.client_ul_pilot_symbols());
        let ul_idx = config.frame.ul_symbol_idx(symbol).unwrap();

        unsafe {
            for ant in 0..2 {
                fx.buffers
                    .ul_bits
                    .row_mut(layout.ul_data_row(frame_id, 0, ant))
                    .copy_from_slice(fx.reference.ul_bits(0, ant));
            }
        }
        let mut encoder = codec.encoder();
        assert!(encode(&ctx, encoder.as_mut(), WorkTag::frm_sym_ue(frame_id, symbol, 0)));

        // Perfect soft bits straight from the encoded stream
        unsafe {
            for ant in 0..2 {
                let encoded = fx.buffers.ul_encoded.row(layout.ul_data_row(frame_id, 0, ant));
                let llr = fx.buffers.ul_demod.row_mut(layout.ul_demod_row(frame_id, ul_idx, ant));
                for (l, bit) in llr.iter_mut().zip(encoded) {
                    *l = if *bit == 0 { LLR_GAIN as i8 } else { -(LLR_GAIN as i8) };
                }
            }
        }
        let mut decoder = codec.decoder();
        for ant in 0..2 {
            // The first block alone leaves the second untouched
            assert!(decode(&ctx, decoder.as_mut(), WorkTag::frm_sym_cb(frame_id, symbol, ant, 0)));
            let half = config.ul_code.info_bytes();
            let decoded = unsafe { fx.buffers.ul_decoded.row(layout.ul_data_row(frame_id, 0, ant)) };
            assert_eq!(decoded[..half], fx.reference.ul_bits(0, ant)[..half]);
            assert!(decoded[half..].iter().all(|b| *b == 0));

            assert!(decode(&ctx, decoder.as_mut(), WorkTag::frm_sym_cb(frame_id, symbol, ant, 1)));
            let decoded = unsafe { fx.buffers.ul_decoded.row(layout.ul_data_row(frame_id, 0, ant)) };
            assert_eq!(decoded, fx.reference.ul_bits(0, ant));
        }
    }

    #[test]
    fn test_decode_rejects_pilot_symbols() {
        let fx = Fixture::new(Fixture::small_params());
        let codec = RepetitionCodec::new(2).unwrap();
        let mut decoder = codec.decoder();
        let pilot = fx.config.frame.ul_symbol(0);
        assert!(!decode(&fx.ctx(), decoder.as_mut(), WorkTag::frm_sym_ant(0, pilot, 0)));
    }

    #[test]
    fn test_out_of_range_units_are_rejected() {
        let fx = Fixture::new(Fixture::small_params());
        let config = &fx.config;
        let codec = RepetitionCodec::new(config.fec_repetition).unwrap();
        let symbol = config.frame.ul_symbol(config.frame.client_ul_pilot_symbols());
        let dl_symbol = config.frame.dl_symbol(config.frame.client_dl_pilot_symbols());
        let mut decoder = codec.decoder();
        let mut encoder = codec.encoder();
        let ctx = fx.ctx();

        let cbs = config.ul_code.blocks_per_symbol;
        assert!(!decode(&ctx, decoder.as_mut(), WorkTag::frm_sym_cb(0, symbol, 0, cbs)));
        assert!(!decode(&ctx, decoder.as_mut(), WorkTag::frm_sym_cb(0, dl_symbol, 0, config.dl_code.blocks_per_symbol)));
        assert!(!decode(&ctx, decoder.as_mut(), WorkTag::frm_sym_cb(0, symbol, config.ue_ant_num, 0)));
        assert!(!encode(&ctx, encoder.as_mut(), WorkTag::frm_sym_ue(0, symbol, config.ue_num)));
        assert!(encode(&ctx, encoder.as_mut(), WorkTag::frm_sym_ue(0, symbol, config.ue_num - 1)));
    }
}
