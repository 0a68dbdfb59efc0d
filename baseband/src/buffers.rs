//! Frame-Window Buffer Set
//!
//! Every per-frame buffer is a table of rows addressed by a pure function of
//! the work tag and the static configuration. Frame `f` lives in window slot
//! `f % W`; slots are reused by overwrite, never freed.
//!
//! There is no locking. Exclusive access to a row (or element) is
//! guaranteed by the stage graph: one stage type writes a given cell, and its
//! consumers only run after the producer's completion has been observed.

use std::cell::UnsafeCell;

use common::{Config, TRANSPOSE_BLOCK_SIZE};
use interfaces::StatsSink;
use num_complex::{Complex, Complex32};

use crate::EngineError;

/// Fixed-size table of `rows * row_len` cells shared across workers
pub struct WindowTable<T> {
    cells: Box<[UnsafeCell<T>]>,
    rows: usize,
    row_len: usize,
}

// Rows are handed out under the stage-graph exclusion invariant.
unsafe impl<T: Send> Sync for WindowTable<T> {}

impl<T: Copy + Default> WindowTable<T> {
    pub fn new(rows: usize, row_len: usize) -> Self {
        let cells = (0..rows * row_len)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells, rows, row_len }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    fn row_cells(&self, row: usize) -> &[UnsafeCell<T>] {
        &self.cells[row * self.row_len..(row + 1) * self.row_len]
    }

    /// Shared view of one row.
    ///
    /// # Safety
    /// No writer may access `row` for the lifetime of the returned slice.
    pub unsafe fn row(&self, row: usize) -> &[T] {
        let cells = self.row_cells(row);
        std::slice::from_raw_parts(UnsafeCell::raw_get(cells.as_ptr()), cells.len())
    }

    /// Exclusive view of one row.
    ///
    /// # Safety
    /// The caller must be the only accessor of `row` for the lifetime of the
    /// returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, row: usize) -> &mut [T] {
        let cells = self.row_cells(row);
        std::slice::from_raw_parts_mut(UnsafeCell::raw_get(cells.as_ptr()), cells.len())
    }

    /// Exclusive view of `len` elements of one row starting at `start`.
    ///
    /// # Safety
    /// The caller must be the only accessor of those elements for the
    /// lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, row: usize, start: usize, len: usize) -> &mut [T] {
        let cells = &self.row_cells(row)[start..start + len];
        std::slice::from_raw_parts_mut(UnsafeCell::raw_get(cells.as_ptr()), len)
    }

    /// Write one element without forming a reference to the rest of the row.
    ///
    /// # Safety
    /// No other access to this element may happen concurrently.
    pub unsafe fn write(&self, row: usize, idx: usize, value: T) {
        *self.row_cells(row)[idx].get() = value;
    }

    /// Read one element.
    ///
    /// # Safety
    /// No concurrent writer to this element.
    pub unsafe fn read(&self, row: usize, idx: usize) -> T {
        *self.row_cells(row)[idx].get()
    }
}

/// Pure `Resolve(tag) -> row` arithmetic for every table
#[derive(Debug, Clone)]
pub struct BufferLayout {
    pub frame_window: usize,
    pub num_pilot_syms: usize,
    pub num_ul_syms: usize,
    pub num_ul_data_syms: usize,
    pub num_dl_syms: usize,
    pub num_dl_data_syms: usize,
    pub client_ul_pilot_syms: usize,
    pub client_dl_pilot_syms: usize,
    pub bs_ant_num: usize,
    pub ue_ant_num: usize,
    pub zf_sc_num: usize,
    pub demul_blocks: usize,
}

impl BufferLayout {
    pub fn new(config: &Config) -> Self {
        let frame = &config.frame;
        Self {
            frame_window: config.frame_window,
            num_pilot_syms: frame.num_pilot_syms(),
            num_ul_syms: frame.num_ul_syms(),
            num_ul_data_syms: frame.num_ul_data_syms(),
            num_dl_syms: frame.num_dl_syms(),
            num_dl_data_syms: frame.num_dl_data_syms(),
            client_ul_pilot_syms: frame.client_ul_pilot_symbols(),
            client_dl_pilot_syms: frame.client_dl_pilot_symbols(),
            bs_ant_num: config.bs_ant_num,
            ue_ant_num: config.ue_ant_num,
            zf_sc_num: config.ofdm_data_num,
            demul_blocks: config.demul_blocks_per_symbol(),
        }
    }

    pub fn slot(&self, frame_id: u64) -> usize {
        (frame_id % self.frame_window as u64) as usize
    }

    fn cube(&self, frame_id: u64, sym: usize, num_syms: usize, unit: usize, num_units: usize) -> usize {
        debug_assert!(sym < num_syms && unit < num_units);
        (self.slot(frame_id) * num_syms + sym) * num_units + unit
    }

    /// Terminal transmit samples, `[slot][ul_symbol][ue_ant]`
    pub fn ul_tx_row(&self, frame_id: u64, ul_symbol_idx: usize, ant: usize) -> usize {
        self.cube(frame_id, ul_symbol_idx, self.num_ul_syms, ant, self.ue_ant_num)
    }

    /// Terminal uplink bits, encoded bits and modulated symbols,
    /// `[slot][ul_data_symbol][ue_ant]`
    pub fn ul_data_row(&self, frame_id: u64, ul_data_idx: usize, ant: usize) -> usize {
        self.cube(frame_id, ul_data_idx, self.num_ul_data_syms, ant, self.ue_ant_num)
    }

    /// Base-station received samples, `[slot][pilot symbols then ul symbols][bs_ant]`
    pub fn bs_rx_row(&self, frame_id: u64, bs_symbol_idx: usize, ant: usize) -> usize {
        self.cube(
            frame_id,
            bs_symbol_idx,
            self.num_pilot_syms + self.num_ul_syms,
            ant,
            self.bs_ant_num,
        )
    }

    /// Base-station pilot spectra, `[slot][pilot_symbol]`, partial transpose inside
    pub fn pilot_fft_row(&self, frame_id: u64, pilot_idx: usize) -> usize {
        self.cube(frame_id, pilot_idx, self.num_pilot_syms, 0, 1)
    }

    /// Base-station uplink spectra, `[slot][ul_symbol]`, partial transpose inside
    pub fn ul_fft_row(&self, frame_id: u64, ul_symbol_idx: usize) -> usize {
        self.cube(frame_id, ul_symbol_idx, self.num_ul_syms, 0, 1)
    }

    /// Zero-forcing matrices, `[slot][zf_sc]`, each `ue_ant x bs_ant` row-major
    pub fn zf_row(&self, frame_id: u64, zf_sc: usize) -> usize {
        self.cube(frame_id, zf_sc, self.zf_sc_num, 0, 1)
    }

    /// Phase-tracking partials, `[slot][client_pilot_symbol][demul_block]`
    pub fn phase_row(&self, frame_id: u64, pilot_symbol_idx: usize, block: usize) -> usize {
        self.cube(
            frame_id,
            pilot_symbol_idx,
            self.client_ul_pilot_syms,
            block,
            self.demul_blocks,
        )
    }

    /// Uplink EVM partials of the first data symbol, `[slot][demul_block]`
    pub fn ul_evm_row(&self, frame_id: u64, block: usize) -> usize {
        self.cube(frame_id, block, self.demul_blocks, 0, 1)
    }

    /// Downlink EVM, `[slot][dl_data_symbol]`, one value per terminal antenna
    pub fn dl_evm_row(&self, frame_id: u64, dl_data_idx: usize) -> usize {
        self.cube(frame_id, dl_data_idx, self.num_dl_data_syms, 0, 1)
    }

    /// Exported constellation, `[slot][ul_symbol]`, `sc * ue_ant + ue` inside
    pub fn ul_equal_row(&self, frame_id: u64, ul_symbol_idx: usize) -> usize {
        self.cube(frame_id, ul_symbol_idx, self.num_ul_syms, 0, 1)
    }

    /// Uplink soft bits, `[slot][ul_symbol][ue_ant]`
    pub fn ul_demod_row(&self, frame_id: u64, ul_symbol_idx: usize, ue: usize) -> usize {
        self.cube(frame_id, ul_symbol_idx, self.num_ul_syms, ue, self.ue_ant_num)
    }

    /// Terminal downlink samples and spectra, `[slot][dl_symbol][ue_ant]`
    pub fn dl_symbol_row(&self, frame_id: u64, dl_symbol_idx: usize, ant: usize) -> usize {
        self.cube(frame_id, dl_symbol_idx, self.num_dl_syms, ant, self.ue_ant_num)
    }

    /// Downlink channel-estimate partials, `[slot][client_pilot_symbol][ue_ant]`
    pub fn csi_row(&self, frame_id: u64, pilot_symbol_idx: usize, ant: usize) -> usize {
        self.cube(
            frame_id,
            pilot_symbol_idx,
            self.client_dl_pilot_syms,
            ant,
            self.ue_ant_num,
        )
    }

    /// Downlink equalized symbols, soft bits and decoded bytes,
    /// `[slot][dl_data_symbol][ue_ant]`
    pub fn dl_data_row(&self, frame_id: u64, dl_data_idx: usize, ant: usize) -> usize {
        self.cube(frame_id, dl_data_idx, self.num_dl_data_syms, ant, self.ue_ant_num)
    }

    /// Position of `(sc, ant)` in a partial-transpose symbol
    pub fn transposed_index(&self, sc: usize, ant: usize) -> usize {
        (sc / TRANSPOSE_BLOCK_SIZE) * (TRANSPOSE_BLOCK_SIZE * self.bs_ant_num)
            + ant * TRANSPOSE_BLOCK_SIZE
            + sc % TRANSPOSE_BLOCK_SIZE
    }
}

/// All frame-window tables of the engine
pub struct FrameBuffers {
    pub layout: BufferLayout,

    // Terminal uplink transmit chain
    pub ul_bits: WindowTable<u8>,
    pub ul_encoded: WindowTable<u8>,
    pub ul_modul: WindowTable<Complex32>,
    pub ul_tx: WindowTable<Complex<i16>>,

    // Base-station uplink receive chain
    pub bs_rx: WindowTable<Complex<i16>>,
    pub pilot_fft: WindowTable<Complex32>,
    pub ul_fft: WindowTable<Complex32>,
    pub ul_zf: WindowTable<Complex32>,
    pub ul_phase: WindowTable<Complex32>,
    pub ul_equal: WindowTable<Complex32>,
    pub ul_demod: WindowTable<i8>,
    pub ul_decoded: WindowTable<u8>,
    pub ul_evm: WindowTable<f32>,

    // Terminal downlink receive chain
    pub dl_rx: WindowTable<Complex<i16>>,
    pub dl_fft: WindowTable<Complex32>,
    pub dl_csi: WindowTable<Complex32>,
    pub dl_equal: WindowTable<Complex32>,
    pub dl_demod: WindowTable<i8>,
    pub dl_decoded: WindowTable<u8>,
    pub dl_evm: WindowTable<f32>,
}

impl FrameBuffers {
    pub fn new(config: &Config) -> Self {
        let layout = BufferLayout::new(config);
        let w = layout.frame_window;
        let ue = layout.ue_ant_num;
        let bs = layout.bs_ant_num;
        let data_num = config.ofdm_data_num;
        let mod_bits = config.modulation.bits_per_symbol();
        let samps = config.samps_per_symbol;
        let ul_syms = layout.num_ul_syms;
        let ul_data = layout.num_ul_data_syms;
        let dl_syms = layout.num_dl_syms;
        let dl_data = layout.num_dl_data_syms;

        let export_len = if config.export_constellation { data_num * ue } else { 0 };

        Self {
            ul_bits: WindowTable::new(w * ul_data * ue, config.ul_code.info_bytes_per_symbol()),
            ul_encoded: WindowTable::new(w * ul_data * ue, config.ul_code.encoded_bits_per_symbol()),
            ul_modul: WindowTable::new(w * ul_data * ue, data_num),
            ul_tx: WindowTable::new(w * ul_syms * ue, samps),

            bs_rx: WindowTable::new(w * (layout.num_pilot_syms + ul_syms) * bs, samps),
            pilot_fft: WindowTable::new(w * layout.num_pilot_syms, config.transposed_symbol_len()),
            ul_fft: WindowTable::new(w * ul_syms, config.transposed_symbol_len()),
            ul_zf: WindowTable::new(w * layout.zf_sc_num, ue * bs),
            ul_phase: WindowTable::new(w * layout.client_ul_pilot_syms * layout.demul_blocks, ue),
            ul_equal: WindowTable::new(w * ul_syms, export_len),
            ul_demod: WindowTable::new(w * ul_syms * ue, data_num * mod_bits),
            ul_decoded: WindowTable::new(w * ul_data * ue, config.ul_code.info_bytes_per_symbol()),
            ul_evm: WindowTable::new(w * layout.demul_blocks, ue),

            dl_rx: WindowTable::new(w * dl_syms * ue, samps),
            dl_fft: WindowTable::new(w * dl_syms * ue, config.ofdm_ca_num),
            dl_csi: WindowTable::new(w * layout.client_dl_pilot_syms * ue, data_num),
            dl_equal: WindowTable::new(w * dl_data * ue, data_num),
            dl_demod: WindowTable::new(w * dl_data * ue, config.dl_data_tone_num() * mod_bits),
            dl_decoded: WindowTable::new(w * dl_data * ue, config.dl_code.info_bytes_per_symbol()),
            dl_evm: WindowTable::new(w * dl_data, ue),

            layout,
        }
    }

    /// Clear the per-frame accumulators of the slot `frame_id` is about to
    /// occupy.
    ///
    /// # Safety
    /// No task of the frame may be queued or running, and the previous
    /// occupant of the slot must have retired.
    pub unsafe fn reset_accumulators(&self, frame_id: u64) {
        for pilot in 0..self.layout.client_ul_pilot_syms {
            for block in 0..self.layout.demul_blocks {
                self.ul_phase
                    .row_mut(self.layout.phase_row(frame_id, pilot, block))
                    .fill(Complex32::default());
            }
        }
        for pilot in 0..self.layout.client_dl_pilot_syms {
            for ant in 0..self.layout.ue_ant_num {
                self.dl_csi
                    .row_mut(self.layout.csi_row(frame_id, pilot, ant))
                    .fill(Complex32::default());
            }
        }
        for block in 0..self.layout.demul_blocks {
            self.ul_evm.row_mut(self.layout.ul_evm_row(frame_id, block)).fill(0.0);
        }
        for data in 0..self.layout.num_dl_data_syms {
            self.dl_evm.row_mut(self.layout.dl_evm_row(frame_id, data)).fill(0.0);
        }
    }

    /// Hand the EVM partials of `frame_id` to the stats sink.
    ///
    /// # Safety
    /// Every task of the frame must have completed.
    pub unsafe fn report_diagnostics(&self, frame_id: u64, stats: &dyn StatsSink) {
        let layout = &self.layout;
        if layout.num_ul_data_syms > 0 {
            for ue in 0..layout.ue_ant_num {
                let error: f32 = (0..layout.demul_blocks)
                    .map(|block| self.ul_evm.read(layout.ul_evm_row(frame_id, block), ue))
                    .sum();
                stats.update_ul_evm(frame_id, ue, error);
            }
        }
        for data in 0..layout.num_dl_data_syms {
            let row = self.dl_evm.row(layout.dl_evm_row(frame_id, data));
            for (ant, evm) in row.iter().enumerate() {
                stats.update_dl_evm(frame_id, data, ant, *evm);
            }
        }
    }
}

/// Tracks which frame occupies each window slot
#[derive(Debug)]
pub struct FrameWindow {
    slots: Vec<Option<SlotState>>,
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    frame_id: u64,
    retired: bool,
}

impl FrameWindow {
    pub fn new(frame_window: usize) -> Self {
        Self {
            slots: vec![None; frame_window],
        }
    }

    fn slot(&self, frame_id: u64) -> usize {
        (frame_id % self.slots.len() as u64) as usize
    }

    /// Claim the slot of `frame_id`; its previous occupant must have retired
    pub fn admit(&mut self, frame_id: u64) -> Result<(), EngineError> {
        let slot = self.slot(frame_id);
        match self.slots[slot] {
            Some(state) if !state.retired => Err(EngineError::WindowOverrun {
                frame_id,
                occupant: state.frame_id,
            }),
            _ => {
                self.slots[slot] = Some(SlotState {
                    frame_id,
                    retired: false,
                });
                Ok(())
            }
        }
    }

    /// Mark `frame_id` as fully consumed
    pub fn retire(&mut self, frame_id: u64) -> Result<(), EngineError> {
        let slot = self.slot(frame_id);
        match &mut self.slots[slot] {
            Some(state) if state.frame_id == frame_id => {
                state.retired = true;
                Ok(())
            }
            _ => Err(EngineError::NotInFlight(frame_id)),
        }
    }

    /// Whether `frame_id` is admitted and not yet retired
    pub fn is_in_flight(&self, frame_id: u64) -> bool {
        matches!(self.slots[self.slot(frame_id)], Some(s) if s.frame_id == frame_id && !s.retired)
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().flatten().filter(|s| !s.retired).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ConfigParams;
    use std::collections::HashSet;

    fn config() -> Config {
        Config::new(ConfigParams {
            frame_window: 4,
            ..ConfigParams::default()
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_is_collision_free_within_a_generation() {
        let config = config();
        let layout = BufferLayout::new(&config);
        let w = layout.frame_window as u64;
        let rows = (layout.num_pilot_syms + layout.num_ul_syms) * layout.bs_ant_num;

        let mut seen = HashSet::new();
        for frame in 100..100 + w {
            for sym in 0..layout.num_pilot_syms + layout.num_ul_syms {
                for ant in 0..layout.bs_ant_num {
                    let row = layout.bs_rx_row(frame, sym, ant);
                    assert!(row < w as usize * rows);
                    assert!(seen.insert(row), "collision at {} {} {}", frame, sym, ant);
                }
            }
        }

        let mut seen = HashSet::new();
        for frame in 0..w {
            for sym in 0..layout.num_ul_syms {
                for ue in 0..layout.ue_ant_num {
                    assert!(seen.insert(layout.ul_demod_row(frame, sym, ue)));
                }
            }
        }
        assert_eq!(seen.len(), w as usize * layout.num_ul_syms * layout.ue_ant_num);

        let mut seen = HashSet::new();
        for frame in 0..w {
            for pilot in 0..layout.client_ul_pilot_syms {
                for block in 0..layout.demul_blocks {
                    assert!(seen.insert(layout.phase_row(frame, pilot, block)));
                }
            }
        }
    }

    #[test]
    fn test_transposed_index_is_a_permutation() {
        let config = config();
        let layout = BufferLayout::new(&config);
        let len = config.transposed_symbol_len();
        let mut seen = HashSet::new();
        for sc in 0..config.ofdm_data_num {
            for ant in 0..config.bs_ant_num {
                let idx = layout.transposed_index(sc, ant);
                assert!(idx < len);
                assert!(seen.insert(idx));
            }
        }
        // Eight subcarriers of one antenna share a cache line
        assert_eq!(layout.transposed_index(7, 2) - layout.transposed_index(0, 2), 7);
        assert_eq!(layout.transposed_index(16, 0), TRANSPOSE_BLOCK_SIZE * config.bs_ant_num);
    }

    #[test]
    fn test_window_wrap_overwrites_slot() {
        let config = config();
        let buffers = FrameBuffers::new(&config);
        let layout = &buffers.layout;
        let w = layout.frame_window as u64;
        let f = 7;
        assert_eq!(layout.ul_data_row(f, 1, 2), layout.ul_data_row(f + w, 1, 2));

        unsafe {
            let row = layout.ul_data_row(f, 1, 2);
            buffers.ul_modul.row_mut(row).fill(Complex32::new(1.0, 0.0));
            buffers.ul_modul.row_mut(layout.ul_data_row(f + w, 1, 2))
                .fill(Complex32::new(0.0, 2.0));
            assert!(buffers.ul_modul.row(row).iter().all(|v| *v == Complex32::new(0.0, 2.0)));

            // Accumulators of the new occupant start from zero
            let phase = layout.phase_row(f, 0, 1);
            buffers.ul_phase.write(phase, 0, Complex32::new(3.0, 3.0));
            buffers.dl_csi.write(layout.csi_row(f, 0, 0), 5, Complex32::new(1.0, 1.0));
            buffers.ul_evm.write(layout.ul_evm_row(f, 2), 1, 4.0);
            buffers.reset_accumulators(f + w);
            assert_eq!(buffers.ul_evm.read(layout.ul_evm_row(f + w, 2), 1), 0.0);
            assert_eq!(buffers.ul_phase.read(phase, 0), Complex32::default());
            assert_eq!(buffers.dl_csi.read(layout.csi_row(f + w, 0, 0), 5), Complex32::default());
        }
    }

    #[test]
    fn test_diagnostics_are_combined_per_frame() {
        let config = config();
        let buffers = FrameBuffers::new(&config);
        let stats = interfaces::PhyStats::new(&config);
        let layout = &buffers.layout;
        let f = 2;
        assert!(layout.demul_blocks >= 2 && layout.num_dl_data_syms > 0);
        unsafe {
            buffers.reset_accumulators(f);
            buffers.ul_evm.write(layout.ul_evm_row(f, 0), 1, 0.5);
            buffers.ul_evm.write(layout.ul_evm_row(f, 1), 1, 0.25);
            buffers.dl_evm.write(layout.dl_evm_row(f, 0), 0, 0.125);
            // A neighbouring frame stays out of the sums
            buffers.ul_evm.write(layout.ul_evm_row(f + 1, 0), 1, 9.0);
            buffers.report_diagnostics(f, &stats);
        }
        let ul = stats.ul_evm(f);
        assert!((ul[1] - 0.75 / config.ofdm_data_num as f32).abs() < 1e-9);
        assert_eq!(ul[0], 0.0);
        assert_eq!(stats.dl_evm(f)[0], 0.125);
    }

    #[test]
    fn test_frame_window_admission() {
        let mut window = FrameWindow::new(2);
        window.admit(0).unwrap();
        window.admit(1).unwrap();
        assert_eq!(window.in_flight(), 2);
        assert!(matches!(
            window.admit(2),
            Err(EngineError::WindowOverrun { frame_id: 2, occupant: 0 })
        ));
        window.retire(0).unwrap();
        assert!(!window.is_in_flight(0));
        window.admit(2).unwrap();
        assert!(window.is_in_flight(2));
        assert!(window.retire(0).is_err());
    }
}
