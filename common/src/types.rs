//! Common Types for the Baseband Engine
//!
//! Defines the work tag, the stage event set and the modulation schemes
//! shared by every pipeline stage.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ConfigError;

/// Bit-packed work identifier passed by value between stages.
///
/// Layout (LSB first): `sub_id` 12 bits, `unit_id` 10 bits, `symbol_id`
/// 10 bits, `frame_id` 32 bits. `unit_id` is an antenna or UE index and
/// `sub_id` a subcarrier or code-block index depending on the stage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkTag(u64);

impl WorkTag {
    pub const SUB_BITS: u32 = 12;
    pub const UNIT_BITS: u32 = 10;
    pub const SYMBOL_BITS: u32 = 10;
    pub const FRAME_BITS: u32 = 32;

    /// Largest encodable subcarrier / code-block index
    pub const MAX_SUB: usize = (1 << Self::SUB_BITS) - 1;
    /// Largest encodable antenna / UE index
    pub const MAX_UNIT: usize = (1 << Self::UNIT_BITS) - 1;
    /// Largest encodable symbol index
    pub const MAX_SYMBOL: usize = (1 << Self::SYMBOL_BITS) - 1;
    /// Largest encodable frame id
    pub const MAX_FRAME: u64 = (1 << Self::FRAME_BITS) - 1;

    const UNIT_SHIFT: u32 = Self::SUB_BITS;
    const SYMBOL_SHIFT: u32 = Self::UNIT_SHIFT + Self::UNIT_BITS;
    const FRAME_SHIFT: u32 = Self::SYMBOL_SHIFT + Self::SYMBOL_BITS;

    /// Pack a tag, rejecting fields that do not fit their bit width
    pub fn try_new(
        frame_id: u64,
        symbol_id: usize,
        unit_id: usize,
        sub_id: usize,
    ) -> Result<Self, ConfigError> {
        if frame_id > Self::MAX_FRAME {
            return Err(ConfigError::TagOutOfRange("frame_id", frame_id));
        }
        if symbol_id > Self::MAX_SYMBOL {
            return Err(ConfigError::TagOutOfRange("symbol_id", symbol_id as u64));
        }
        if unit_id > Self::MAX_UNIT {
            return Err(ConfigError::TagOutOfRange("unit_id", unit_id as u64));
        }
        if sub_id > Self::MAX_SUB {
            return Err(ConfigError::TagOutOfRange("sub_id", sub_id as u64));
        }
        Ok(Self::pack(frame_id, symbol_id, unit_id, sub_id))
    }

    /// Pack a tag whose fields are known to be within the configured bounds
    pub fn new(frame_id: u64, symbol_id: usize, unit_id: usize, sub_id: usize) -> Self {
        debug_assert!(frame_id <= Self::MAX_FRAME, "frame_id {} out of range", frame_id);
        debug_assert!(symbol_id <= Self::MAX_SYMBOL, "symbol_id {} out of range", symbol_id);
        debug_assert!(unit_id <= Self::MAX_UNIT, "unit_id {} out of range", unit_id);
        debug_assert!(sub_id <= Self::MAX_SUB, "sub_id {} out of range", sub_id);
        Self::pack(frame_id, symbol_id, unit_id, sub_id)
    }

    fn pack(frame_id: u64, symbol_id: usize, unit_id: usize, sub_id: usize) -> Self {
        Self(
            (frame_id << Self::FRAME_SHIFT)
                | ((symbol_id as u64) << Self::SYMBOL_SHIFT)
                | ((unit_id as u64) << Self::UNIT_SHIFT)
                | sub_id as u64,
        )
    }

    /// Tag addressing one antenna of a symbol
    pub fn frm_sym_ant(frame_id: u64, symbol_id: usize, ant_id: usize) -> Self {
        Self::new(frame_id, symbol_id, ant_id, 0)
    }

    /// Tag addressing one UE of a symbol
    pub fn frm_sym_ue(frame_id: u64, symbol_id: usize, ue_id: usize) -> Self {
        Self::new(frame_id, symbol_id, ue_id, 0)
    }

    /// Tag addressing a block of subcarriers starting at `sc_id`
    pub fn frm_sym_sc(frame_id: u64, symbol_id: usize, sc_id: usize) -> Self {
        Self::new(frame_id, symbol_id, 0, sc_id)
    }

    /// Tag addressing one code block of one antenna
    pub fn frm_sym_cb(frame_id: u64, symbol_id: usize, ant_id: usize, cb_id: usize) -> Self {
        Self::new(frame_id, symbol_id, ant_id, cb_id)
    }

    /// Rebuild a tag from its raw key
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw integral key
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn frame_id(&self) -> u64 {
        self.0 >> Self::FRAME_SHIFT
    }

    pub fn symbol_id(&self) -> usize {
        ((self.0 >> Self::SYMBOL_SHIFT) & Self::MAX_SYMBOL as u64) as usize
    }

    /// Antenna or UE index
    pub fn unit_id(&self) -> usize {
        ((self.0 >> Self::UNIT_SHIFT) & Self::MAX_UNIT as u64) as usize
    }

    pub fn ant_id(&self) -> usize {
        self.unit_id()
    }

    pub fn ue_id(&self) -> usize {
        self.unit_id()
    }

    /// Subcarrier or code-block index
    pub fn sub_id(&self) -> usize {
        (self.0 & Self::MAX_SUB as u64) as usize
    }

    pub fn sc_id(&self) -> usize {
        self.sub_id()
    }

    pub fn cb_id(&self) -> usize {
        self.sub_id()
    }
}

impl fmt::Debug for WorkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkTag(frame {}, symbol {}, unit {}, sub {})",
            self.frame_id(),
            self.symbol_id(),
            self.unit_id(),
            self.sub_id()
        )
    }
}

/// Event kinds carried on the work and notification queues.
///
/// Workers handle the stage kinds; the remaining kinds belong to the
/// conductor and other collaborators and are never valid work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Serialize, Deserialize)]
pub enum EventType {
    /// Received packet handed over by the radio front end
    PacketRx = 0,
    /// FFT of a data symbol
    FftData = 1,
    /// FFT of a pilot symbol
    FftPilot = 2,
    /// Zero-forcing matrix computation
    Zf = 3,
    /// Equalization and soft demodulation
    Demodulate = 4,
    /// FEC decoding
    Decode = 5,
    /// FEC encoding
    Encode = 6,
    /// Constellation mapping
    Modulate = 7,
    /// Inverse FFT and transmit packing
    InverseFft = 8,
    /// Transmit packet handed to the radio front end
    PacketTx = 9,
}

impl EventType {
    /// Stage kinds a worker knows how to execute
    pub const STAGES: [EventType; 7] = [
        EventType::FftData,
        EventType::FftPilot,
        EventType::Demodulate,
        EventType::Decode,
        EventType::Encode,
        EventType::Modulate,
        EventType::InverseFft,
    ];

    /// Whether a worker can execute this event
    pub fn is_stage(&self) -> bool {
        Self::STAGES.contains(self)
    }
}

/// `{event_type, tag}` pair moved through a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub event_type: EventType,
    pub tag: WorkTag,
}

impl Event {
    pub fn new(event_type: EventType, tag: WorkTag) -> Self {
        Self { event_type, tag }
    }
}

/// Role of one symbol slot within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolRole {
    /// Uplink channel-estimation pilot received by the base station
    Pilot,
    /// Uplink symbol (client pilot or data)
    Uplink,
    /// Downlink symbol (client pilot or data)
    Downlink,
    /// Guard period, never processed
    Guard,
}

impl SymbolRole {
    /// Parse one character of a frame schedule
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'P' => Some(SymbolRole::Pilot),
            'U' => Some(SymbolRole::Uplink),
            'D' => Some(SymbolRole::Downlink),
            'G' => Some(SymbolRole::Guard),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            SymbolRole::Pilot => 'P',
            SymbolRole::Uplink => 'U',
            SymbolRole::Downlink => 'D',
            SymbolRole::Guard => 'G',
        }
    }
}

/// Modulation schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModulationScheme {
    Bpsk,
    Qpsk,
    Qam16,
    Qam64,
    Qam256,
}

impl ModulationScheme {
    /// Bits carried by one constellation point
    pub fn bits_per_symbol(&self) -> usize {
        match self {
            ModulationScheme::Bpsk => 1,
            ModulationScheme::Qpsk => 2,
            ModulationScheme::Qam16 => 4,
            ModulationScheme::Qam64 => 6,
            ModulationScheme::Qam256 => 8,
        }
    }

    /// Parse the configuration spelling (`"QPSK"`, `"16QAM"`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BPSK" => Some(ModulationScheme::Bpsk),
            "QPSK" => Some(ModulationScheme::Qpsk),
            "16QAM" | "QAM16" => Some(ModulationScheme::Qam16),
            "64QAM" | "QAM64" => Some(ModulationScheme::Qam64),
            "256QAM" | "QAM256" => Some(ModulationScheme::Qam256),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModulationScheme::Bpsk => "BPSK",
            ModulationScheme::Qpsk => "QPSK",
            ModulationScheme::Qam16 => "16QAM",
            ModulationScheme::Qam64 => "64QAM",
            ModulationScheme::Qam256 => "256QAM",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_tag_round_trip_at_field_limits() {
        let cases = [
            (0u64, 0usize, 0usize, 0usize),
            (WorkTag::MAX_FRAME, WorkTag::MAX_SYMBOL, WorkTag::MAX_UNIT, WorkTag::MAX_SUB),
            (1, WorkTag::MAX_SYMBOL, 0, WorkTag::MAX_SUB),
            (WorkTag::MAX_FRAME, 0, WorkTag::MAX_UNIT, 0),
            (123_456, 17, 63, 1200),
        ];
        for (frame, symbol, unit, sub) in cases {
            let tag = WorkTag::try_new(frame, symbol, unit, sub).unwrap();
            assert_eq!(tag.frame_id(), frame);
            assert_eq!(tag.symbol_id(), symbol);
            assert_eq!(tag.unit_id(), unit);
            assert_eq!(tag.sub_id(), sub);
            assert_eq!(WorkTag::from_raw(tag.raw()), tag);
        }
    }

    #[test]
    fn test_tag_rejects_out_of_range_fields() {
        assert!(WorkTag::try_new(WorkTag::MAX_FRAME + 1, 0, 0, 0).is_err());
        assert!(WorkTag::try_new(0, WorkTag::MAX_SYMBOL + 1, 0, 0).is_err());
        assert!(WorkTag::try_new(0, 0, WorkTag::MAX_UNIT + 1, 0).is_err());
        assert!(WorkTag::try_new(0, 0, 0, WorkTag::MAX_SUB + 1).is_err());
    }

    #[test]
    fn test_tags_differing_in_one_field_are_distinct() {
        let base = WorkTag::new(5, 3, 2, 1);
        assert_ne!(base, WorkTag::new(6, 3, 2, 1));
        assert_ne!(base, WorkTag::new(5, 4, 2, 1));
        assert_ne!(base, WorkTag::new(5, 3, 3, 1));
        assert_ne!(base, WorkTag::new(5, 3, 2, 2));
        assert_eq!(base, WorkTag::new(5, 3, 2, 1));
    }

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::from_u8(4), Some(EventType::Demodulate));
        assert_eq!(EventType::from_u8(42), None);
        assert!(EventType::InverseFft.is_stage());
        assert!(!EventType::Zf.is_stage());
        assert!(!EventType::PacketRx.is_stage());
    }

    #[test]
    fn test_modulation_names() {
        assert_eq!(ModulationScheme::from_name("16qam"), Some(ModulationScheme::Qam16));
        assert_eq!(ModulationScheme::from_name("QPSK").unwrap().bits_per_symbol(), 2);
        assert_eq!(ModulationScheme::from_name("8PSK"), None);
        assert_eq!(SymbolRole::from_char('U'), Some(SymbolRole::Uplink));
        assert_eq!(SymbolRole::from_char('x'), None);
    }
}
