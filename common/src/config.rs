//! Engine Configuration
//!
//! `ConfigParams` mirrors the TOML file; `Config` is the validated,
//! frame-invariant view shared read-only by every stage handler.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::FrameLayout;
use crate::types::{ModulationScheme, WorkTag};
use crate::ConfigError;

/// Subcarriers per 64-byte cache line of `Complex32`
pub const SCS_PER_CACHELINE: usize = 8;

/// Subcarriers per block of the partial-transpose uplink layout
pub const TRANSPOSE_BLOCK_SIZE: usize = 16;

/// Raw configuration as read from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigParams {
    /// Symbol schedule, one of `P`/`U`/`D`/`G` per symbol
    #[serde(default = "default_frame")]
    pub frame: String,
    /// Base-station antennas
    #[serde(default = "default_bs_ant_num")]
    pub bs_ant_num: usize,
    /// Number of UEs
    #[serde(default = "default_ue_num")]
    pub ue_num: usize,
    /// Antennas (channels) per UE
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    /// FFT size
    #[serde(default = "default_ofdm_ca_num")]
    pub ofdm_ca_num: usize,
    /// First data subcarrier
    #[serde(default = "default_ofdm_data_start")]
    pub ofdm_data_start: usize,
    /// Number of data subcarriers
    #[serde(default = "default_ofdm_data_num")]
    pub ofdm_data_num: usize,
    /// Cyclic prefix length in samples
    #[serde(default = "default_cp_len")]
    pub cp_len: usize,
    /// Zero samples before each transmitted symbol
    #[serde(default)]
    pub ofdm_tx_zero_prefix: usize,
    /// Zero samples after each transmitted symbol
    #[serde(default)]
    pub ofdm_tx_zero_postfix: usize,
    /// Receive-side offset of the cyclic prefix; defaults to the TX prefix
    #[serde(default)]
    pub ofdm_rx_zero_prefix: Option<usize>,
    /// Modulation name (`BPSK`, `QPSK`, `16QAM`, `64QAM`, `256QAM`)
    #[serde(default = "default_modulation")]
    pub modulation: String,
    /// Subcarriers per demodulation task
    #[serde(default = "default_demul_block_size")]
    pub demul_block_size: usize,
    /// Frames that may be in flight at once
    #[serde(default = "default_frame_window")]
    pub frame_window: usize,
    /// Client pilot symbols at the start of the uplink region
    #[serde(default = "default_client_ul_pilot_symbols")]
    pub client_ul_pilot_symbols: usize,
    /// Client pilot symbols at the start of the downlink region
    #[serde(default = "default_client_dl_pilot_symbols")]
    pub client_dl_pilot_symbols: usize,
    /// Pilot tone spacing in downlink data symbols, 0 disables pilot tones
    #[serde(default = "default_ofdm_pilot_spacing")]
    pub ofdm_pilot_spacing: usize,
    /// UEs share ZF matrices across groups of `ue_ant_num` subcarriers
    #[serde(default)]
    pub freq_orthogonal_pilot: bool,
    /// Keep equalized uplink values in a shared constellation buffer
    #[serde(default)]
    pub export_constellation: bool,
    /// Worker threads
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,
    /// First core used when pinning workers
    #[serde(default)]
    pub core_offset: usize,
    /// Pin worker `i` to core `core_offset + i`
    #[serde(default)]
    pub pin_workers: bool,
    /// Capacity of the work and notification queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Code blocks per symbol and antenna
    #[serde(default = "default_code_blocks_per_symbol")]
    pub code_blocks_per_symbol: usize,
    /// Repetition factor of the built-in FEC codec
    #[serde(default = "default_fec_repetition")]
    pub fec_repetition: usize,
    /// Time-domain scale applied before conversion to `i16`
    #[serde(default)]
    pub tx_scale: Option<f32>,
    /// Seed of the reference pilot and payload generator
    #[serde(default = "default_reference_seed")]
    pub reference_seed: u64,
}

fn default_frame() -> String {
    "PUUUUUGDDDD".to_string()
}

fn default_bs_ant_num() -> usize {
    8
}

fn default_ue_num() -> usize {
    4
}

fn default_num_channels() -> usize {
    1
}

fn default_ofdm_ca_num() -> usize {
    256
}

fn default_ofdm_data_start() -> usize {
    32
}

fn default_ofdm_data_num() -> usize {
    192
}

fn default_cp_len() -> usize {
    32
}

fn default_modulation() -> String {
    "16QAM".to_string()
}

fn default_demul_block_size() -> usize {
    48
}

fn default_frame_window() -> usize {
    16
}

fn default_client_ul_pilot_symbols() -> usize {
    2
}

fn default_client_dl_pilot_symbols() -> usize {
    1
}

fn default_ofdm_pilot_spacing() -> usize {
    16
}

fn default_worker_num() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1 << 16
}

fn default_code_blocks_per_symbol() -> usize {
    1
}

fn default_fec_repetition() -> usize {
    2
}

fn default_reference_seed() -> u64 {
    0x5eed
}

impl ConfigParams {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

impl Default for ConfigParams {
    fn default() -> Self {
        Self {
            frame: default_frame(),
            bs_ant_num: default_bs_ant_num(),
            ue_num: default_ue_num(),
            num_channels: default_num_channels(),
            ofdm_ca_num: default_ofdm_ca_num(),
            ofdm_data_start: default_ofdm_data_start(),
            ofdm_data_num: default_ofdm_data_num(),
            cp_len: default_cp_len(),
            ofdm_tx_zero_prefix: 0,
            ofdm_tx_zero_postfix: 0,
            ofdm_rx_zero_prefix: None,
            modulation: default_modulation(),
            demul_block_size: default_demul_block_size(),
            frame_window: default_frame_window(),
            client_ul_pilot_symbols: default_client_ul_pilot_symbols(),
            client_dl_pilot_symbols: default_client_dl_pilot_symbols(),
            ofdm_pilot_spacing: default_ofdm_pilot_spacing(),
            freq_orthogonal_pilot: false,
            export_constellation: false,
            worker_num: default_worker_num(),
            core_offset: 0,
            pin_workers: false,
            queue_capacity: default_queue_capacity(),
            code_blocks_per_symbol: default_code_blocks_per_symbol(),
            fec_repetition: default_fec_repetition(),
            tx_scale: None,
            reference_seed: default_reference_seed(),
        }
    }
}

/// Code-block geometry of one link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlockConfig {
    /// Code blocks per symbol and antenna
    pub blocks_per_symbol: usize,
    /// Information bits per block (multiple of 8)
    pub info_bits: usize,
    /// Encoded bits per block
    pub encoded_bits: usize,
}

impl CodeBlockConfig {
    fn derive(capacity_bits: usize, blocks_per_symbol: usize, repetition: usize) -> Result<Self, ConfigError> {
        if blocks_per_symbol == 0 || repetition == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "code_blocks_per_symbol and fec_repetition must be positive".to_string(),
            ));
        }
        let per_block = capacity_bits / blocks_per_symbol;
        let info_bits = (per_block / repetition) / 8 * 8;
        if info_bits == 0 {
            return Err(ConfigError::InvalidConfiguration(format!(
                "{} bits per symbol cannot carry {} code blocks at repetition {}",
                capacity_bits, blocks_per_symbol, repetition
            )));
        }
        Ok(Self {
            blocks_per_symbol,
            info_bits,
            encoded_bits: info_bits * repetition,
        })
    }

    /// Information bytes per block
    pub fn info_bytes(&self) -> usize {
        self.info_bits / 8
    }

    /// Information bytes per symbol and antenna
    pub fn info_bytes_per_symbol(&self) -> usize {
        self.info_bytes() * self.blocks_per_symbol
    }

    /// Encoded bits per symbol and antenna
    pub fn encoded_bits_per_symbol(&self) -> usize {
        self.encoded_bits * self.blocks_per_symbol
    }
}

/// Validated engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub frame: FrameLayout,
    pub modulation: ModulationScheme,
    pub bs_ant_num: usize,
    pub ue_num: usize,
    pub num_channels: usize,
    /// `ue_num * num_channels`
    pub ue_ant_num: usize,
    pub ofdm_ca_num: usize,
    pub ofdm_data_start: usize,
    pub ofdm_data_num: usize,
    pub cp_len: usize,
    pub ofdm_tx_zero_prefix: usize,
    pub ofdm_tx_zero_postfix: usize,
    pub ofdm_rx_zero_prefix: usize,
    /// Samples per transmitted or received symbol
    pub samps_per_symbol: usize,
    pub demul_block_size: usize,
    pub frame_window: usize,
    pub ofdm_pilot_spacing: usize,
    /// Pilot tones per downlink data symbol
    pub ofdm_pilot_num: usize,
    pub freq_orthogonal_pilot: bool,
    pub export_constellation: bool,
    pub worker_num: usize,
    pub core_offset: usize,
    pub pin_workers: bool,
    pub queue_capacity: usize,
    pub fec_repetition: usize,
    pub ul_code: CodeBlockConfig,
    pub dl_code: CodeBlockConfig,
    pub tx_scale: f32,
    pub reference_seed: u64,
}

impl Config {
    /// Validate raw parameters; any violation is fatal at startup
    pub fn new(params: ConfigParams) -> Result<Self, ConfigError> {
        let frame = FrameLayout::parse(
            &params.frame,
            params.client_ul_pilot_symbols,
            params.client_dl_pilot_symbols,
        )?;
        let modulation = ModulationScheme::from_name(&params.modulation).ok_or_else(|| {
            ConfigError::InvalidConfiguration(format!("unknown modulation '{}'", params.modulation))
        })?;

        let invalid = |msg: String| Err(ConfigError::InvalidConfiguration(msg));

        if params.bs_ant_num == 0 || params.ue_num == 0 || params.num_channels == 0 {
            return invalid("antenna and UE counts must be positive".to_string());
        }
        let ue_ant_num = params.ue_num * params.num_channels;
        if params.bs_ant_num > WorkTag::MAX_UNIT + 1 || ue_ant_num > WorkTag::MAX_UNIT + 1 {
            return invalid(format!(
                "at most {} antennas fit in a work tag",
                WorkTag::MAX_UNIT + 1
            ));
        }
        if ue_ant_num > params.bs_ant_num {
            return invalid(format!(
                "{} UE antennas exceed {} base-station antennas",
                ue_ant_num, params.bs_ant_num
            ));
        }
        if frame.num_symbols() > WorkTag::MAX_SYMBOL + 1 {
            return invalid(format!("at most {} symbols per frame", WorkTag::MAX_SYMBOL + 1));
        }
        if params.ofdm_data_num == 0 || params.ofdm_data_num > WorkTag::MAX_SUB + 1 {
            return invalid(format!(
                "ofdm_data_num must be in 1..={}",
                WorkTag::MAX_SUB + 1
            ));
        }
        if params.ofdm_data_start + params.ofdm_data_num > params.ofdm_ca_num {
            return invalid(format!(
                "data band {}..{} exceeds FFT size {}",
                params.ofdm_data_start,
                params.ofdm_data_start + params.ofdm_data_num,
                params.ofdm_ca_num
            ));
        }
        if params.cp_len > params.ofdm_ca_num {
            return invalid("cp_len exceeds FFT size".to_string());
        }
        if params.demul_block_size == 0 || params.demul_block_size % SCS_PER_CACHELINE != 0 {
            return invalid(format!(
                "demul_block_size {} must be a positive multiple of {}",
                params.demul_block_size, SCS_PER_CACHELINE
            ));
        }
        if params.ofdm_data_num % SCS_PER_CACHELINE != 0 {
            return invalid(format!(
                "ofdm_data_num {} must be a multiple of {}",
                params.ofdm_data_num, SCS_PER_CACHELINE
            ));
        }
        if frame.num_dl_data_syms() > 0 && frame.client_dl_pilot_symbols() == 0 {
            return invalid("downlink data symbols need at least one client pilot symbol".to_string());
        }
        if params.frame_window == 0 {
            return invalid("frame_window must be at least 1".to_string());
        }
        if params.worker_num == 0 {
            return invalid("worker_num must be at least 1".to_string());
        }
        if params.queue_capacity == 0 {
            return invalid("queue_capacity must be positive".to_string());
        }

        let samps_per_symbol = params.ofdm_tx_zero_prefix
            + params.cp_len
            + params.ofdm_ca_num
            + params.ofdm_tx_zero_postfix;
        let ofdm_rx_zero_prefix = params
            .ofdm_rx_zero_prefix
            .unwrap_or(params.ofdm_tx_zero_prefix);
        if ofdm_rx_zero_prefix + params.cp_len + params.ofdm_ca_num > samps_per_symbol {
            return invalid(format!(
                "rx zero prefix {} leaves less than one FFT window per symbol",
                ofdm_rx_zero_prefix
            ));
        }

        let ofdm_pilot_num = if params.ofdm_pilot_spacing == 0 {
            0
        } else {
            (params.ofdm_data_num + params.ofdm_pilot_spacing - 1) / params.ofdm_pilot_spacing
        };
        if ofdm_pilot_num >= params.ofdm_data_num {
            return invalid("pilot spacing leaves no downlink data tones".to_string());
        }

        let bits = modulation.bits_per_symbol();
        let ul_code = CodeBlockConfig::derive(
            params.ofdm_data_num * bits,
            params.code_blocks_per_symbol,
            params.fec_repetition,
        )?;
        let dl_code = CodeBlockConfig::derive(
            (params.ofdm_data_num - ofdm_pilot_num) * bits,
            params.code_blocks_per_symbol,
            params.fec_repetition,
        )?;
        if params.code_blocks_per_symbol > WorkTag::MAX_SUB + 1 {
            return invalid("too many code blocks per symbol".to_string());
        }

        let tx_scale = match params.tx_scale {
            Some(scale) if scale > 0.0 => scale,
            Some(scale) => return invalid(format!("tx_scale {} must be positive", scale)),
            None => 1.0 / (6.0 * (params.ofdm_data_num as f32).sqrt()),
        };

        debug!(
            "Validated config: frame {}, {}x{} antennas, {} data subcarriers, {}",
            frame.schedule(),
            params.bs_ant_num,
            ue_ant_num,
            params.ofdm_data_num,
            modulation.name()
        );

        Ok(Self {
            frame,
            modulation,
            bs_ant_num: params.bs_ant_num,
            ue_num: params.ue_num,
            num_channels: params.num_channels,
            ue_ant_num,
            ofdm_ca_num: params.ofdm_ca_num,
            ofdm_data_start: params.ofdm_data_start,
            ofdm_data_num: params.ofdm_data_num,
            cp_len: params.cp_len,
            ofdm_tx_zero_prefix: params.ofdm_tx_zero_prefix,
            ofdm_tx_zero_postfix: params.ofdm_tx_zero_postfix,
            ofdm_rx_zero_prefix,
            samps_per_symbol,
            demul_block_size: params.demul_block_size,
            frame_window: params.frame_window,
            ofdm_pilot_spacing: params.ofdm_pilot_spacing,
            ofdm_pilot_num,
            freq_orthogonal_pilot: params.freq_orthogonal_pilot,
            export_constellation: params.export_constellation,
            worker_num: params.worker_num,
            core_offset: params.core_offset,
            pin_workers: params.pin_workers,
            queue_capacity: params.queue_capacity,
            fec_repetition: params.fec_repetition,
            ul_code,
            dl_code,
            tx_scale,
            reference_seed: params.reference_seed,
        })
    }

    /// One past the last data subcarrier
    pub fn ofdm_data_stop(&self) -> usize {
        self.ofdm_data_start + self.ofdm_data_num
    }

    /// Whether data subcarrier `sc` carries a downlink pilot tone
    pub fn is_pilot_tone(&self, sc: usize) -> bool {
        self.ofdm_pilot_spacing != 0 && sc % self.ofdm_pilot_spacing == 0
    }

    /// Downlink data tones per symbol
    pub fn dl_data_tone_num(&self) -> usize {
        self.ofdm_data_num - self.ofdm_pilot_num
    }

    /// Subcarrier whose ZF matrix equalizes `sc`
    pub fn zf_sc_id(&self, sc: usize) -> usize {
        if self.freq_orthogonal_pilot {
            sc - sc % self.ue_ant_num
        } else {
            sc
        }
    }

    /// Demodulation tasks per uplink symbol
    pub fn demul_blocks_per_symbol(&self) -> usize {
        (self.ofdm_data_num + self.demul_block_size - 1) / self.demul_block_size
    }

    /// Length of one symbol in the partial-transpose layout
    pub fn transposed_symbol_len(&self) -> usize {
        let blocks = (self.ofdm_data_num + TRANSPOSE_BLOCK_SIZE - 1) / TRANSPOSE_BLOCK_SIZE;
        blocks * TRANSPOSE_BLOCK_SIZE * self.bs_ant_num
    }

    /// Window slot occupied by `frame_id`
    pub fn frame_slot(&self, frame_id: u64) -> usize {
        (frame_id % self.frame_window as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config::new(ConfigParams::default()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.ue_ant_num, 4);
        assert_eq!(config.samps_per_symbol, 256 + 32);
        assert_eq!(config.ofdm_pilot_num, 12);
        assert_eq!(config.dl_data_tone_num(), 180);
        assert_eq!(config.demul_blocks_per_symbol(), 4);
        assert_eq!(config.frame.num_ul_data_syms(), 3);
        // 192 tones * 4 bits / repetition 2
        assert_eq!(config.ul_code.info_bits, 384);
        assert_eq!(config.ul_code.encoded_bits, 768);
        // 180 tones * 4 bits / repetition 2
        assert_eq!(config.dl_code.info_bits, 360);
    }

    #[test]
    fn test_block_size_must_divide_cacheline_group() {
        let params = ConfigParams {
            demul_block_size: 20,
            ..ConfigParams::default()
        };
        assert!(matches!(
            Config::new(params),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_data_band_must_fit_fft() {
        let params = ConfigParams {
            ofdm_data_start: 100,
            ..ConfigParams::default()
        };
        assert!(Config::new(params).is_err());
    }

    #[test]
    fn test_more_ue_antennas_than_bs_antennas_rejected() {
        let params = ConfigParams {
            bs_ant_num: 4,
            ue_num: 3,
            num_channels: 2,
            ..ConfigParams::default()
        };
        assert!(Config::new(params).is_err());
    }

    #[test]
    fn test_unknown_modulation_rejected() {
        let params = ConfigParams {
            modulation: "8PSK".to_string(),
            ..ConfigParams::default()
        };
        assert!(Config::new(params).is_err());
    }

    #[test]
    fn test_from_toml() {
        let params = ConfigParams::from_toml_str(
            r#"
            frame = "PUUUDD"
            bs_ant_num = 4
            ue_num = 2
            modulation = "QPSK"
            client_ul_pilot_symbols = 1
            client_dl_pilot_symbols = 1
            frame_window = 4
            "#,
        )
        .unwrap();
        let config = Config::new(params).unwrap();
        assert_eq!(config.frame.num_ul_syms(), 3);
        assert_eq!(config.modulation, ModulationScheme::Qpsk);
        assert_eq!(config.frame_slot(9), 1);
        assert!(matches!(
            ConfigParams::from_toml_str("no_such_field = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zf_sc_id_mapping() {
        let params = ConfigParams {
            freq_orthogonal_pilot: true,
            ..ConfigParams::default()
        };
        let config = Config::new(params).unwrap();
        assert_eq!(config.zf_sc_id(0), 0);
        assert_eq!(config.zf_sc_id(3), 0);
        assert_eq!(config.zf_sc_id(5), 4);
        assert_eq!(default_config().zf_sc_id(5), 5);
    }
}
