//! Loopback Conductor
//!
//! Drives frames through the engine with a synthetic channel instead of a
//! radio. Uplink runs the terminal transmit chain (encode, modulate, IFFT),
//! combines the antennas over a flat orthogonal channel and feeds the
//! base-station receive chain. Downlink synthesizes the base-station signal
//! and runs the terminal receive chain. Decoded bits are compared with the
//! reference payload.
//!
//! Frames run in batches of at most one window. Within a batch each stage
//! is enqueued only after its producer stage has fully completed, which is
//! what the buffer exclusion rules rely on.

use num_complex::{Complex, Complex32};
use std::collections::{HashMap, HashSet};
use std::f32::consts::PI;
use std::time::Duration;
use tracing::{debug, info, warn};

use common::{cf32_from_ci16, ci16_from_cf32, count_byte_errors, Config, Event, EventType, WorkTag};

use crate::engine::Engine;
use crate::phy::OfdmProcessor;
use crate::EngineError;

/// Link directions exercised per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
    Both,
}

impl Direction {
    pub fn uplink(&self) -> bool {
        matches!(self, Direction::Uplink | Direction::Both)
    }

    pub fn downlink(&self) -> bool {
        matches!(self, Direction::Downlink | Direction::Both)
    }
}

/// Impairments of the synthetic channel
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelModel {
    /// Common phase added per uplink symbol, radians
    pub ul_phase_drift: f32,
    /// Common phase added to downlink data symbols, radians
    pub dl_phase_offset: f32,
    /// Downlink channel phase slope across subcarriers, radians
    pub dl_phase_slope: f32,
}

/// Outcome of one loopback frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame_id: u64,
    pub ul_bytes: usize,
    pub ul_byte_errors: usize,
    pub dl_bytes: usize,
    pub dl_byte_errors: usize,
    pub completions: usize,
    /// Code-block decode completions, a subset of `completions`
    pub decode_completions: usize,
}

/// Flat uplink channel with orthonormal columns, `[bs_ant][ue_ant]`
fn uplink_channel(config: &Config) -> Vec<Complex32> {
    let (bs, ue) = (config.bs_ant_num, config.ue_ant_num);
    let amplitude = 1.0 / (bs as f32).sqrt();
    (0..bs)
        .flat_map(|a| {
            (0..ue).map(move |u| Complex32::from_polar(amplitude, -2.0 * PI * (a * u) as f32 / bs as f32))
        })
        .collect()
}

/// One decode per code block of every antenna of `symbols`
fn decode_events(batch: &[u64], symbols: &[usize], ant_num: usize, cb_num: usize) -> Vec<Event> {
    let mut events = Vec::with_capacity(batch.len() * symbols.len() * ant_num * cb_num);
    for &f in batch {
        for &s in symbols {
            for a in 0..ant_num {
                for cb in 0..cb_num {
                    events.push(Event::new(EventType::Decode, WorkTag::frm_sym_cb(f, s, a, cb)));
                }
            }
        }
    }
    events
}

/// Runs frames through an engine
pub struct LoopbackConductor<'a> {
    engine: &'a mut Engine,
    direction: Direction,
    channel: ChannelModel,
    timeout: Duration,
    ofdm: OfdmProcessor,
    ul_channel: Vec<Complex32>,
    /// Completion counts of the frames in flight
    progress: HashMap<u64, FrameReport>,
}

impl<'a> LoopbackConductor<'a> {
    pub fn new(engine: &'a mut Engine, direction: Direction) -> Self {
        let ofdm = OfdmProcessor::new(engine.config().ofdm_ca_num);
        let ul_channel = uplink_channel(engine.config());
        Self {
            engine,
            direction,
            channel: ChannelModel::default(),
            timeout: Duration::from_secs(5),
            ofdm,
            ul_channel,
            progress: HashMap::new(),
        }
    }

    pub fn with_channel(mut self, channel: ChannelModel) -> Self {
        self.channel = channel;
        self
    }

    /// Maximum wait for a single completion
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `num_frames` frames starting at `first_frame`
    pub fn run(&mut self, first_frame: u64, num_frames: usize) -> Result<Vec<FrameReport>, EngineError> {
        let window = self.engine.config().frame_window;
        let frames: Vec<u64> = (first_frame..first_frame + num_frames as u64).collect();
        let mut reports = Vec::with_capacity(num_frames);

        for batch in frames.chunks(window) {
            if let Err(e) = self.run_batch(batch) {
                self.abandon(batch);
                return Err(e);
            }
            for &frame_id in batch {
                let report = self.check_frame(frame_id);
                if report.ul_byte_errors + report.dl_byte_errors > 0 {
                    warn!(
                        "Frame {}: {} uplink and {} downlink byte errors",
                        frame_id, report.ul_byte_errors, report.dl_byte_errors
                    );
                } else {
                    debug!("Frame {} decoded cleanly", frame_id);
                }
                self.engine.retire_frame(frame_id)?;
                reports.push(report);
            }
        }

        // Nothing may arrive once every expected completion was consumed
        if let Some(extra) = self.engine.recv_completion_timeout(Duration::from_millis(20))? {
            return Err(EngineError::UnexpectedCompletion(extra.event_type, extra.tag));
        }
        info!("Loopback finished {} frames", reports.len());
        Ok(reports)
    }

    fn run_batch(&mut self, batch: &[u64]) -> Result<(), EngineError> {
        for &frame_id in batch {
            self.engine.admit_frame(frame_id)?;
            self.progress.insert(
                frame_id,
                FrameReport {
                    frame_id,
                    ..FrameReport::default()
                },
            );
            self.load_frame(frame_id);
        }
        if self.direction.uplink() {
            self.run_uplink(batch)?;
        }
        if self.direction.downlink() {
            self.run_downlink(batch)?;
        }
        Ok(())
    }

    /// Release the admitted frames of a failed batch
    fn abandon(&mut self, batch: &[u64]) {
        for &frame_id in batch {
            self.progress.remove(&frame_id);
            if self.engine.is_in_flight(frame_id) && self.engine.abandon_frame(frame_id).is_ok() {
                warn!("Frame {} abandoned", frame_id);
            }
        }
    }

    /// Enqueue `events` and wait until each has completed exactly once.
    /// Outstanding work never exceeds the queue capacity, so the
    /// notification queue cannot overflow.
    fn run_stage(&mut self, events: Vec<Event>) -> Result<(), EngineError> {
        let capacity = self.engine.config().queue_capacity;
        let mut pending: HashSet<Event> = events.iter().copied().collect();
        let mut queued = events.into_iter().peekable();
        let mut outstanding = 0usize;

        while !pending.is_empty() {
            while outstanding < capacity {
                let Some(event) = queued.peek() else {
                    break;
                };
                match self.engine.enqueue(*event) {
                    Ok(()) => {
                        queued.next();
                        outstanding += 1;
                    }
                    Err(EngineError::QueueFull) => break,
                    Err(e) => return Err(e),
                }
            }
            match self.engine.recv_completion_timeout(self.timeout)? {
                Some(done) => {
                    if !pending.remove(&done) {
                        return Err(EngineError::UnexpectedCompletion(done.event_type, done.tag));
                    }
                    outstanding -= 1;
                    if let Some(progress) = self.progress.get_mut(&done.tag.frame_id()) {
                        progress.completions += 1;
                        if done.event_type == EventType::Decode {
                            progress.decode_completions += 1;
                        }
                    }
                }
                None => return Err(EngineError::MissingCompletions(outstanding)),
            }
        }
        Ok(())
    }

    /// Write the per-frame inputs that come from outside the engine
    fn load_frame(&mut self, frame_id: u64) {
        let config = self.engine.config();
        let buffers = self.engine.buffers();
        let reference = self.engine.reference();
        let layout = &buffers.layout;
        let (bs, ue) = (config.bs_ant_num, config.ue_ant_num);

        // SAFETY: the frame was just admitted and none of its work is queued
        unsafe {
            if self.direction.uplink() {
                for d in 0..layout.num_ul_data_syms {
                    for ant in 0..ue {
                        buffers
                            .ul_bits
                            .row_mut(layout.ul_data_row(frame_id, d, ant))
                            .copy_from_slice(reference.ul_bits(d, ant));
                    }
                }

                // Zero-forcing for the flat channel including the FFT gain
                let gain = config.ofdm_ca_num as f32 * config.tx_scale;
                for sc in 0..config.ofdm_data_num {
                    let zf = buffers.ul_zf.row_mut(layout.zf_row(frame_id, sc));
                    for u in 0..ue {
                        for a in 0..bs {
                            zf[u * bs + a] = self.ul_channel[a * ue + u].conj() / gain;
                        }
                    }
                }

                // Base-station pilot symbols
                let mut band = vec![Complex32::default(); config.ofdm_data_num];
                for p in 0..layout.num_pilot_syms {
                    for a in 0..bs {
                        for (sc, v) in band.iter_mut().enumerate() {
                            *v = (0..ue)
                                .map(|u| self.ul_channel[a * ue + u] * reference.pilot(u)[sc])
                                .sum();
                        }
                        self.ofdm.modulate_band(
                            &band,
                            config.ofdm_data_start,
                            buffers.bs_rx.row_mut(layout.bs_rx_row(frame_id, p, a)),
                            config.ofdm_tx_zero_prefix,
                            config.cp_len,
                            config.tx_scale,
                        );
                    }
                }
            }

            if self.direction.downlink() {
                let mut band = vec![Complex32::default(); config.ofdm_data_num];
                for dl_idx in 0..layout.num_dl_syms {
                    let symbol_id = config.frame.dl_symbol(dl_idx);
                    let data_idx = config.frame.dl_data_symbol_idx(symbol_id);
                    for ant in 0..ue {
                        let (source, phase) = match data_idx {
                            Some(d) => (reference.dl_iq(d, ant), self.channel.dl_phase_offset),
                            None => (reference.pilot(ant), 0.0),
                        };
                        for (sc, (v, x)) in band.iter_mut().zip(source).enumerate() {
                            *v = x * Complex32::from_polar(1.0, phase + self.channel.dl_phase_slope * sc as f32);
                        }
                        self.ofdm.modulate_band(
                            &band,
                            config.ofdm_data_start,
                            buffers.dl_rx.row_mut(layout.dl_symbol_row(frame_id, dl_idx, ant)),
                            config.ofdm_tx_zero_prefix,
                            config.cp_len,
                            config.tx_scale,
                        );
                    }
                }
            }
        }
    }

    /// Combine terminal transmit samples into base-station receive samples
    fn propagate_uplink(&self, frame_id: u64) {
        let config = self.engine.config();
        let buffers = self.engine.buffers();
        let layout = &buffers.layout;
        let (bs, ue) = (config.bs_ant_num, config.ue_ant_num);

        // SAFETY: every IFFT of the frame completed and no base-station FFT
        // has been queued yet
        unsafe {
            for ul_idx in 0..layout.num_ul_syms {
                let drift = Complex32::from_polar(1.0, self.channel.ul_phase_drift * ul_idx as f32);
                let tx: Vec<&[Complex<i16>]> = (0..ue)
                    .map(|u| buffers.ul_tx.row(layout.ul_tx_row(frame_id, ul_idx, u)))
                    .collect();
                for a in 0..bs {
                    let rx = buffers
                        .bs_rx
                        .row_mut(layout.bs_rx_row(frame_id, layout.num_pilot_syms + ul_idx, a));
                    for (t, sample) in rx.iter_mut().enumerate() {
                        let combined: Complex32 = (0..ue)
                            .map(|u| self.ul_channel[a * ue + u] * cf32_from_ci16(tx[u][t]))
                            .sum();
                        *sample = ci16_from_cf32(combined * drift);
                    }
                }
            }
        }
    }

    fn run_uplink(&mut self, batch: &[u64]) -> Result<(), EngineError> {
        let config = self.engine.config().clone();
        let frame = &config.frame;
        let ul_symbols = frame.ul_symbols().to_vec();
        let data_symbols: Vec<usize> = ul_symbols
            .iter()
            .copied()
            .filter(|s| frame.ul_data_symbol_idx(*s).is_some())
            .collect();
        let pilot_symbols: Vec<usize> = ul_symbols
            .iter()
            .copied()
            .filter(|s| frame.is_ul_client_pilot(*s))
            .collect();
        let blocks: Vec<usize> = (0..config.ofdm_data_num).step_by(config.demul_block_size).collect();
        let blocks = blocks.as_slice();

        let per_ue = |event_type: EventType, symbols: &[usize]| -> Vec<Event> {
            batch
                .iter()
                .flat_map(|&f| {
                    symbols.iter().flat_map(move |&s| {
                        (0..config.ue_num).map(move |u| Event::new(event_type, WorkTag::frm_sym_ue(f, s, u)))
                    })
                })
                .collect()
        };
        let per_ant = |event_type: EventType, symbols: &[usize], units: usize| -> Vec<Event> {
            batch
                .iter()
                .flat_map(|&f| {
                    symbols.iter().flat_map(move |&s| {
                        (0..units).map(move |a| Event::new(event_type, WorkTag::frm_sym_ant(f, s, a)))
                    })
                })
                .collect()
        };
        let per_block = |symbols: &[usize]| -> Vec<Event> {
            batch
                .iter()
                .flat_map(|&f| {
                    symbols.iter().flat_map(move |&s| {
                        blocks
                            .iter()
                            .map(move |&sc| Event::new(EventType::Demodulate, WorkTag::frm_sym_sc(f, s, sc)))
                    })
                })
                .collect()
        };

        self.run_stage(per_ue(EventType::Encode, &data_symbols))?;
        self.run_stage(per_ue(EventType::Modulate, &data_symbols))?;
        self.run_stage(per_ue(EventType::InverseFft, &ul_symbols))?;
        for &frame_id in batch {
            self.propagate_uplink(frame_id);
        }

        let mut fft = per_ant(EventType::FftPilot, frame.pilot_symbols(), config.bs_ant_num);
        fft.extend(per_ant(EventType::FftData, &ul_symbols, config.bs_ant_num));
        self.run_stage(fft)?;

        // Phase partials of every pilot block are read by the data blocks
        self.run_stage(per_block(&pilot_symbols))?;
        self.run_stage(per_block(&data_symbols))?;
        self.run_stage(decode_events(
            batch,
            &data_symbols,
            config.ue_ant_num,
            config.ul_code.blocks_per_symbol,
        ))?;
        Ok(())
    }

    fn run_downlink(&mut self, batch: &[u64]) -> Result<(), EngineError> {
        let config = self.engine.config().clone();
        let frame = &config.frame;
        let (pilots, data): (Vec<usize>, Vec<usize>) =
            frame.dl_symbols().iter().partition(|s| frame.is_dl_client_pilot(**s));
        let per_ant = |event_type: EventType, symbols: &[usize]| -> Vec<Event> {
            batch
                .iter()
                .flat_map(|&f| {
                    symbols.iter().flat_map(move |&s| {
                        (0..config.ue_ant_num).map(move |a| Event::new(event_type, WorkTag::frm_sym_ant(f, s, a)))
                    })
                })
                .collect()
        };

        self.run_stage(per_ant(EventType::FftPilot, &pilots))?;
        self.run_stage(per_ant(EventType::FftData, &data))?;
        self.run_stage(per_ant(EventType::Demodulate, &data))?;
        self.run_stage(decode_events(batch, &data, config.ue_ant_num, config.dl_code.blocks_per_symbol))?;
        Ok(())
    }

    /// Compare decoded payloads with the reference
    fn check_frame(&mut self, frame_id: u64) -> FrameReport {
        let mut report = self.progress.remove(&frame_id).unwrap_or(FrameReport {
            frame_id,
            ..FrameReport::default()
        });
        let config = self.engine.config();
        let buffers = self.engine.buffers();
        let reference = self.engine.reference();
        let layout = &buffers.layout;

        // SAFETY: every decode of the frame completed
        unsafe {
            for ant in 0..config.ue_ant_num {
                if self.direction.uplink() {
                    for d in 0..layout.num_ul_data_syms {
                        let decoded = buffers.ul_decoded.row(layout.ul_data_row(frame_id, d, ant));
                        report.ul_bytes += decoded.len();
                        report.ul_byte_errors += count_byte_errors(decoded, reference.ul_bits(d, ant));
                    }
                }
                if self.direction.downlink() {
                    for d in 0..layout.num_dl_data_syms {
                        let decoded = buffers.dl_decoded.row(layout.dl_data_row(frame_id, d, ant));
                        report.dl_bytes += decoded.len();
                        report.dl_byte_errors += count_byte_errors(decoded, reference.dl_bits(d, ant));
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::test_support::Fixture;
    use interfaces::{PhyStats, RepetitionCodec};
    use std::sync::Arc;

    #[test]
    fn test_uplink_channel_columns_are_orthonormal() {
        let config = Config::new(Fixture::small_params()).unwrap();
        let h = uplink_channel(&config);
        let (bs, ue) = (config.bs_ant_num, config.ue_ant_num);
        for u in 0..ue {
            for v in 0..ue {
                let dot: Complex32 = (0..bs).map(|a| h[a * ue + u].conj() * h[a * ue + v]).sum();
                let expected = if u == v { 1.0 } else { 0.0 };
                assert!((dot - Complex32::new(expected, 0.0)).norm() < 1e-5);
            }
        }
    }

    #[test]
    fn test_single_uplink_frame() {
        let config = Config::new(Fixture::small_params()).unwrap();
        let stats = Arc::new(PhyStats::new(&config));
        let codec = Arc::new(RepetitionCodec::new(config.fec_repetition).unwrap());
        let mut engine = Engine::new(config, codec, stats.clone()).unwrap();
        let reports = LoopbackConductor::new(&mut engine, Direction::Uplink).run(0, 1).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ul_byte_errors, 0);
        assert!(reports[0].ul_bytes > 0);
        assert_eq!(reports[0].dl_bytes, 0);
        assert!(stats.ul_evm(0).iter().all(|e| *e < 1e-3));
        assert_eq!(
            reports[0].decode_completions,
            engine.config().ue_ant_num
                * engine.config().frame.num_ul_data_syms()
                * engine.config().ul_code.blocks_per_symbol
        );
    }

    #[test]
    fn test_failed_batch_releases_admitted_frames() {
        let config = Config::new(Fixture::small_params()).unwrap();
        let w = config.frame_window as u64;
        let stats = Arc::new(PhyStats::new(&config));
        let codec = Arc::new(RepetitionCodec::new(config.fec_repetition).unwrap());
        let mut engine = Engine::new(config, codec, stats).unwrap();

        // A frame held from outside blocks the last slot of the batch
        engine.admit_frame(0).unwrap();
        {
            let mut conductor = LoopbackConductor::new(&mut engine, Direction::Downlink);
            assert!(matches!(
                conductor.run(1, w as usize),
                Err(EngineError::WindowOverrun { frame_id, occupant: 0 }) if frame_id == w
            ));
            assert!(conductor.progress.is_empty());
        }
        for frame_id in 1..w {
            assert!(!engine.is_in_flight(frame_id), "frame {} still admitted", frame_id);
        }
        assert!(engine.is_in_flight(0));

        // The released slots take new frames
        engine.retire_frame(0).unwrap();
        let reports = LoopbackConductor::new(&mut engine, Direction::Downlink).run(w, 2).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.dl_byte_errors == 0));
    }
}
