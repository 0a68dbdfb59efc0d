//! Statistics Sink
//!
//! One-way collector for per-stage durations and link-quality diagnostics.
//! The engine only ever writes here, and never from a stage handler: frame
//! diagnostics arrive when the frame retires, durations when a worker stops.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use common::{Config, EventType};

/// Timed phases per task: total plus up to three kernel sub-phases
pub const DURATION_PHASES: usize = 4;

/// Task counter and accumulated phase durations of one worker and stage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationStat {
    pub task_count: usize,
    pub task_duration: [Duration; DURATION_PHASES],
}

impl DurationStat {
    /// Fold another counter into this one
    pub fn merge(&mut self, other: &DurationStat) {
        self.task_count += other.task_count;
        for (acc, d) in self.task_duration.iter_mut().zip(other.task_duration.iter()) {
            *acc += *d;
        }
    }

    /// Mean duration of `phase` in microseconds
    pub fn average_us(&self, phase: usize) -> f64 {
        if self.task_count == 0 {
            return 0.0;
        }
        self.task_duration[phase].as_secs_f64() * 1e6 / self.task_count as f64
    }
}

/// Collaborator receiving diagnostics from the stage handlers
pub trait StatsSink: Send + Sync {
    /// Called when `frame_id` takes over its window slot
    fn begin_frame(&self, _frame_id: u64) {}

    /// Per-worker stage timing, reported when the worker stops
    fn record_durations(&self, worker_id: usize, event_type: EventType, stat: &DurationStat);

    /// Add uplink squared error of one UE antenna, summed over subcarriers
    fn update_ul_evm(&self, frame_id: u64, ue_ant: usize, error_power: f32);

    /// Downlink EVM of one data symbol at one terminal antenna
    fn update_dl_evm(&self, frame_id: u64, dl_data_symbol: usize, ant: usize, evm: f32);
}

/// Aggregated timing of one stage across all workers
#[derive(Debug, Clone, Serialize)]
pub struct DurationSummary {
    pub event_type: EventType,
    pub task_count: usize,
    pub avg_total_us: f64,
    pub avg_phase_us: [f64; DURATION_PHASES - 1],
}

struct PhyStatsInner {
    /// `[slot][ue_ant]` summed squared error
    ul_evm: Vec<f32>,
    /// `[slot][dl_data_symbol][ant]`
    dl_evm: Vec<f32>,
    durations: HashMap<EventType, DurationStat>,
}

/// Default stats collector keyed by frame-window slot
pub struct PhyStats {
    frame_window: usize,
    ue_ant_num: usize,
    dl_data_syms: usize,
    ofdm_data_num: usize,
    inner: Mutex<PhyStatsInner>,
}

impl PhyStats {
    pub fn new(config: &Config) -> Self {
        let frame_window = config.frame_window;
        let ue_ant_num = config.ue_ant_num;
        let dl_data_syms = config.frame.num_dl_data_syms();
        Self {
            frame_window,
            ue_ant_num,
            dl_data_syms,
            ofdm_data_num: config.ofdm_data_num,
            inner: Mutex::new(PhyStatsInner {
                ul_evm: vec![0.0; frame_window * ue_ant_num],
                dl_evm: vec![0.0; frame_window * dl_data_syms * ue_ant_num],
                durations: HashMap::new(),
            }),
        }
    }

    fn slot(&self, frame_id: u64) -> usize {
        (frame_id % self.frame_window as u64) as usize
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PhyStatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget the diagnostics of the frame previously held by this slot
    pub fn clear_frame(&self, frame_id: u64) {
        let slot = self.slot(frame_id);
        let mut inner = self.lock();
        let ue = self.ue_ant_num;
        inner.ul_evm[slot * ue..(slot + 1) * ue].fill(0.0);
        let dl = self.dl_data_syms * ue;
        inner.dl_evm[slot * dl..(slot + 1) * dl].fill(0.0);
    }

    /// Uplink EVM per UE antenna, normalized by the data subcarrier count
    pub fn ul_evm(&self, frame_id: u64) -> Vec<f32> {
        let slot = self.slot(frame_id);
        let inner = self.lock();
        inner.ul_evm[slot * self.ue_ant_num..(slot + 1) * self.ue_ant_num]
            .iter()
            .map(|e| e / self.ofdm_data_num as f32)
            .collect()
    }

    /// Uplink SNR estimate in dB per UE antenna
    pub fn ul_snr(&self, frame_id: u64) -> Vec<f32> {
        self.ul_evm(frame_id)
            .into_iter()
            .map(|evm| -10.0 * evm.max(f32::MIN_POSITIVE).log10())
            .collect()
    }

    /// Downlink EVM laid out `[dl_data_symbol][ant]`
    pub fn dl_evm(&self, frame_id: u64) -> Vec<f32> {
        let slot = self.slot(frame_id);
        let dl = self.dl_data_syms * self.ue_ant_num;
        let inner = self.lock();
        inner.dl_evm[slot * dl..(slot + 1) * dl].to_vec()
    }

    /// Per-stage timing aggregated over all workers that have stopped
    pub fn durations(&self) -> Vec<DurationSummary> {
        let inner = self.lock();
        let mut summary: Vec<DurationSummary> = inner
            .durations
            .iter()
            .filter(|(_, stat)| stat.task_count > 0)
            .map(|(event_type, stat)| DurationSummary {
                event_type: *event_type,
                task_count: stat.task_count,
                avg_total_us: stat.average_us(0),
                avg_phase_us: [stat.average_us(1), stat.average_us(2), stat.average_us(3)],
            })
            .collect();
        summary.sort_by_key(|s| s.event_type as u8);
        summary
    }
}

impl StatsSink for PhyStats {
    fn begin_frame(&self, frame_id: u64) {
        self.clear_frame(frame_id);
    }

    fn record_durations(&self, worker_id: usize, event_type: EventType, stat: &DurationStat) {
        debug!(
            "Worker {}: {:?} ran {} tasks, {:.2} us avg",
            worker_id,
            event_type,
            stat.task_count,
            stat.average_us(0)
        );
        self.lock().durations.entry(event_type).or_default().merge(stat);
    }

    fn update_ul_evm(&self, frame_id: u64, ue_ant: usize, error_power: f32) {
        let idx = self.slot(frame_id) * self.ue_ant_num + ue_ant;
        self.lock().ul_evm[idx] += error_power;
    }

    fn update_dl_evm(&self, frame_id: u64, dl_data_symbol: usize, ant: usize, evm: f32) {
        let idx = (self.slot(frame_id) * self.dl_data_syms + dl_data_symbol) * self.ue_ant_num + ant;
        let mut inner = self.lock();
        inner.dl_evm[idx] = evm;
        if evm > 0.1 {
            info!(
                "Frame {} DL symbol {} ant {}: EVM {:.3}",
                frame_id, dl_data_symbol, ant, evm
            );
        }
    }
}
