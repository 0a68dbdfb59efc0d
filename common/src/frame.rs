//! Frame Layout
//!
//! Parses the per-frame symbol schedule (`"PPUUUGDDDD"`) and provides the
//! role indices used for compact buffer addressing.

use crate::types::SymbolRole;
use crate::ConfigError;

/// Symbol schedule of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    roles: Vec<SymbolRole>,
    /// Role index of each symbol among symbols sharing its role
    role_index: Vec<usize>,
    pilot_symbols: Vec<usize>,
    ul_symbols: Vec<usize>,
    dl_symbols: Vec<usize>,
    client_ul_pilot_symbols: usize,
    client_dl_pilot_symbols: usize,
}

impl FrameLayout {
    /// Parse a schedule string, one character per symbol
    pub fn parse(
        schedule: &str,
        client_ul_pilot_symbols: usize,
        client_dl_pilot_symbols: usize,
    ) -> Result<Self, ConfigError> {
        let mut roles = Vec::with_capacity(schedule.len());
        for (idx, c) in schedule.chars().enumerate() {
            let role = SymbolRole::from_char(c).ok_or_else(|| {
                ConfigError::InvalidFrame(format!("unknown symbol '{}' at position {}", c, idx))
            })?;
            roles.push(role);
        }
        if roles.is_empty() {
            return Err(ConfigError::InvalidFrame("empty frame schedule".to_string()));
        }

        let mut role_index = Vec::with_capacity(roles.len());
        let mut pilot_symbols = Vec::new();
        let mut ul_symbols = Vec::new();
        let mut dl_symbols = Vec::new();
        let mut guard_count = 0;

        for (symbol_id, role) in roles.iter().enumerate() {
            let list = match role {
                SymbolRole::Pilot => &mut pilot_symbols,
                SymbolRole::Uplink => &mut ul_symbols,
                SymbolRole::Downlink => &mut dl_symbols,
                SymbolRole::Guard => {
                    role_index.push(guard_count);
                    guard_count += 1;
                    continue;
                }
            };
            role_index.push(list.len());
            list.push(symbol_id);
        }

        if client_ul_pilot_symbols > ul_symbols.len() {
            return Err(ConfigError::InvalidFrame(format!(
                "{} client uplink pilot symbols but only {} uplink symbols",
                client_ul_pilot_symbols,
                ul_symbols.len()
            )));
        }
        if client_dl_pilot_symbols > dl_symbols.len() {
            return Err(ConfigError::InvalidFrame(format!(
                "{} client downlink pilot symbols but only {} downlink symbols",
                client_dl_pilot_symbols,
                dl_symbols.len()
            )));
        }

        Ok(Self {
            roles,
            role_index,
            pilot_symbols,
            ul_symbols,
            dl_symbols,
            client_ul_pilot_symbols,
            client_dl_pilot_symbols,
        })
    }

    /// Total symbols per frame
    pub fn num_symbols(&self) -> usize {
        self.roles.len()
    }

    pub fn role(&self, symbol_id: usize) -> Option<SymbolRole> {
        self.roles.get(symbol_id).copied()
    }

    pub fn num_pilot_syms(&self) -> usize {
        self.pilot_symbols.len()
    }

    pub fn num_ul_syms(&self) -> usize {
        self.ul_symbols.len()
    }

    pub fn num_dl_syms(&self) -> usize {
        self.dl_symbols.len()
    }

    /// Client pilot symbols at the start of the uplink region
    pub fn client_ul_pilot_symbols(&self) -> usize {
        self.client_ul_pilot_symbols
    }

    /// Client pilot symbols at the start of the downlink region
    pub fn client_dl_pilot_symbols(&self) -> usize {
        self.client_dl_pilot_symbols
    }

    pub fn num_ul_data_syms(&self) -> usize {
        self.ul_symbols.len() - self.client_ul_pilot_symbols
    }

    pub fn num_dl_data_syms(&self) -> usize {
        self.dl_symbols.len() - self.client_dl_pilot_symbols
    }

    /// Index among base-station pilot symbols
    pub fn pilot_idx(&self, symbol_id: usize) -> Option<usize> {
        self.index_if(symbol_id, SymbolRole::Pilot)
    }

    /// Index among uplink symbols (client pilots included)
    pub fn ul_symbol_idx(&self, symbol_id: usize) -> Option<usize> {
        self.index_if(symbol_id, SymbolRole::Uplink)
    }

    /// Index among downlink symbols (client pilots included)
    pub fn dl_symbol_idx(&self, symbol_id: usize) -> Option<usize> {
        self.index_if(symbol_id, SymbolRole::Downlink)
    }

    /// Index among uplink data symbols, `None` for client pilots
    pub fn ul_data_symbol_idx(&self, symbol_id: usize) -> Option<usize> {
        self.ul_symbol_idx(symbol_id)
            .and_then(|idx| idx.checked_sub(self.client_ul_pilot_symbols))
    }

    /// Index among downlink data symbols, `None` for client pilots
    pub fn dl_data_symbol_idx(&self, symbol_id: usize) -> Option<usize> {
        self.dl_symbol_idx(symbol_id)
            .and_then(|idx| idx.checked_sub(self.client_dl_pilot_symbols))
    }

    pub fn is_ul_client_pilot(&self, symbol_id: usize) -> bool {
        matches!(self.ul_symbol_idx(symbol_id), Some(idx) if idx < self.client_ul_pilot_symbols)
    }

    pub fn is_dl_client_pilot(&self, symbol_id: usize) -> bool {
        matches!(self.dl_symbol_idx(symbol_id), Some(idx) if idx < self.client_dl_pilot_symbols)
    }

    /// Symbol id of the `idx`-th pilot symbol
    pub fn pilot_symbol(&self, idx: usize) -> usize {
        self.pilot_symbols[idx]
    }

    /// Symbol id of the `idx`-th uplink symbol
    pub fn ul_symbol(&self, idx: usize) -> usize {
        self.ul_symbols[idx]
    }

    /// Symbol id of the `idx`-th downlink symbol
    pub fn dl_symbol(&self, idx: usize) -> usize {
        self.dl_symbols[idx]
    }

    pub fn ul_symbols(&self) -> &[usize] {
        &self.ul_symbols
    }

    pub fn dl_symbols(&self) -> &[usize] {
        &self.dl_symbols
    }

    pub fn pilot_symbols(&self) -> &[usize] {
        &self.pilot_symbols
    }

    /// Schedule string this layout was parsed from
    pub fn schedule(&self) -> String {
        self.roles.iter().map(|r| r.as_char()).collect()
    }

    fn index_if(&self, symbol_id: usize, role: SymbolRole) -> Option<usize> {
        match self.roles.get(symbol_id) {
            Some(r) if *r == role => Some(self.role_index[symbol_id]),
            _ => None,
        }
    }
}
