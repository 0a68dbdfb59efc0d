//! Reference Signals
//!
//! Known pilots and payloads shared by the transmit side, the EVM
//! diagnostics and the loopback checks. Built once from a fixed seed.

use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use common::{CodeBlockConfig, Config};
use interfaces::{CodecFactory, Encoder};

use crate::phy::modulation::ModulationTable;
use crate::phy::pilot::ue_specific_pilot;
use crate::phy::transmit::map_encoded_bits;

/// Per-antenna pilots and per-(data symbol, antenna) payloads
pub struct ReferenceSignals {
    ue_ant_num: usize,
    data_num: usize,
    ul_bytes: usize,
    dl_bytes: usize,
    /// `[ue_ant][data_num]`
    pilots: Vec<Complex32>,
    /// `[ul_data_symbol][ue_ant][info bytes]`
    ul_bits: Vec<u8>,
    /// `[ul_data_symbol][ue_ant][data_num]`
    ul_iq: Vec<Complex32>,
    /// `[dl_data_symbol][ue_ant][info bytes]`
    dl_bits: Vec<u8>,
    /// `[dl_data_symbol][ue_ant][data_num]`, pilot tones included
    dl_iq: Vec<Complex32>,
}

/// Encode the code blocks of one symbol
fn encode_symbol(encoder: &mut dyn Encoder, code: &CodeBlockConfig, bits: &[u8], encoded: &mut [u8]) {
    for cb in 0..code.blocks_per_symbol {
        encoder.encode(
            &bits[cb * code.info_bytes()..(cb + 1) * code.info_bytes()],
            &mut encoded[cb * code.encoded_bits..(cb + 1) * code.encoded_bits],
        );
    }
}

impl ReferenceSignals {
    pub fn new(config: &Config, codec: &dyn CodecFactory) -> Self {
        let mut rng = StdRng::seed_from_u64(config.reference_seed);
        let mut encoder = codec.encoder();
        let table = ModulationTable::new(config.modulation);
        let ue = config.ue_ant_num;
        let data_num = config.ofdm_data_num;
        let ul_syms = config.frame.num_ul_data_syms();
        let dl_syms = config.frame.num_dl_data_syms();
        let ul_bytes = config.ul_code.info_bytes_per_symbol();
        let dl_bytes = config.dl_code.info_bytes_per_symbol();

        let pilots: Vec<Complex32> = (0..ue)
            .flat_map(|ant| ue_specific_pilot(config.reference_seed, ant, data_num))
            .collect();

        let mut ul_bits = vec![0u8; ul_syms * ue * ul_bytes];
        rng.fill(&mut ul_bits[..]);
        let mut ul_iq = vec![Complex32::default(); ul_syms * ue * data_num];
        let mut encoded = vec![0u8; config.ul_code.encoded_bits_per_symbol()];
        for (bits, iq) in ul_bits.chunks(ul_bytes).zip(ul_iq.chunks_mut(data_num)) {
            encode_symbol(encoder.as_mut(), &config.ul_code, bits, &mut encoded);
            map_encoded_bits(&table, &encoded, iq);
        }

        let mut dl_bits = vec![0u8; dl_syms * ue * dl_bytes];
        rng.fill(&mut dl_bits[..]);
        let mut dl_iq = vec![Complex32::default(); dl_syms * ue * data_num];
        let mut encoded = vec![0u8; config.dl_code.encoded_bits_per_symbol()];
        let mut tones = vec![Complex32::default(); config.dl_data_tone_num()];
        for (i, (bits, iq)) in dl_bits.chunks(dl_bytes).zip(dl_iq.chunks_mut(data_num)).enumerate() {
            let ant = i % ue;
            encode_symbol(encoder.as_mut(), &config.dl_code, bits, &mut encoded);
            map_encoded_bits(&table, &encoded, &mut tones);
            let pilot = &pilots[ant * data_num..(ant + 1) * data_num];
            let mut data = tones.iter();
            for (sc, value) in iq.iter_mut().enumerate() {
                *value = if config.is_pilot_tone(sc) {
                    pilot[sc]
                } else {
                    data.next().copied().unwrap_or_default()
                };
            }
        }

        debug!(
            "Reference signals: {} UL and {} DL data symbols for {} UE antennas",
            ul_syms, dl_syms, ue
        );

        Self {
            ue_ant_num: ue,
            data_num,
            ul_bytes,
            dl_bytes,
            pilots,
            ul_bits,
            ul_iq,
            dl_bits,
            dl_iq,
        }
    }

    /// Pilot of one UE antenna over the data subcarriers
    pub fn pilot(&self, ant: usize) -> &[Complex32] {
        &self.pilots[ant * self.data_num..(ant + 1) * self.data_num]
    }

    fn index(&self, data_symbol: usize, ant: usize) -> usize {
        data_symbol * self.ue_ant_num + ant
    }

    /// Uplink information bytes of one data symbol and antenna
    pub fn ul_bits(&self, data_symbol: usize, ant: usize) -> &[u8] {
        let i = self.index(data_symbol, ant);
        &self.ul_bits[i * self.ul_bytes..(i + 1) * self.ul_bytes]
    }

    /// Uplink constellation sent for `ul_bits`
    pub fn ul_iq(&self, data_symbol: usize, ant: usize) -> &[Complex32] {
        let i = self.index(data_symbol, ant);
        &self.ul_iq[i * self.data_num..(i + 1) * self.data_num]
    }

    /// Downlink information bytes of one data symbol and antenna
    pub fn dl_bits(&self, data_symbol: usize, ant: usize) -> &[u8] {
        let i = self.index(data_symbol, ant);
        &self.dl_bits[i * self.dl_bytes..(i + 1) * self.dl_bytes]
    }

    /// Downlink data symbol as sent, pilot tones included
    pub fn dl_iq(&self, data_symbol: usize, ant: usize) -> &[Complex32] {
        let i = self.index(data_symbol, ant);
        &self.dl_iq[i * self.data_num..(i + 1) * self.data_num]
    }
}
