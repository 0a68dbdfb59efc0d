//! Worker Threads
//!
//! Each worker busy-polls the shared work queue, dispatches on the event
//! type and publishes exactly one completion per executed work item.
//! Scratch buffers, FFT plans and codec instances are owned by the worker
//! for its whole life.

use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use common::{Config, Event, EventType, SymbolRole};
use interfaces::{Decoder, DurationStat, Encoder};

use crate::engine::Shared;
use crate::phy::{coding, ofdm, transmit};
use crate::phy::{Demodulator, DownlinkReceiver, ModulationTable, OfdmProcessor, StageContext};
use crate::queue::Producer;
use crate::EngineError;

const NUM_EVENT_TYPES: usize = EventType::PacketTx as usize + 1;

/// Long-lived per-worker resources
pub struct WorkerState {
    id: usize,
    ofdm: OfdmProcessor,
    demodulator: Demodulator,
    downlink: DownlinkReceiver,
    table: ModulationTable,
    encoder: Box<dyn Encoder>,
    decoder: Box<dyn Decoder>,
    durations: [DurationStat; NUM_EVENT_TYPES],
}

impl WorkerState {
    pub fn new(id: usize, config: &Config, encoder: Box<dyn Encoder>, decoder: Box<dyn Decoder>) -> Self {
        Self {
            id,
            ofdm: OfdmProcessor::new(config.ofdm_ca_num),
            demodulator: Demodulator::new(config),
            downlink: DownlinkReceiver::new(config.ofdm_data_num),
            table: ModulationTable::new(config.modulation),
            encoder,
            decoder,
            durations: [DurationStat::default(); NUM_EVENT_TYPES],
        }
    }

    /// Run the stage kernel for one event. Returns false when the tag does
    /// not address a symbol this stage can process.
    fn dispatch(&mut self, ctx: &StageContext, event: Event) -> bool {
        let tag = event.tag;
        let role = ctx.config.frame.role(tag.symbol_id());
        match (event.event_type, role) {
            (EventType::FftPilot, Some(SymbolRole::Pilot)) | (EventType::FftData, Some(SymbolRole::Uplink)) => {
                ofdm::fft_uplink(ctx, &mut self.ofdm, event.event_type, tag)
            }
            (EventType::FftPilot, Some(SymbolRole::Downlink)) => {
                self.downlink.fft_pilot(ctx, &mut self.ofdm, tag)
            }
            (EventType::FftData, Some(SymbolRole::Downlink)) => self.downlink.fft_data(ctx, &mut self.ofdm, tag),
            (EventType::Demodulate, Some(SymbolRole::Uplink)) => {
                let stat = &mut self.durations[EventType::Demodulate as usize];
                self.demodulator.launch(ctx, tag, stat)
            }
            (EventType::Demodulate, Some(SymbolRole::Downlink)) => self.downlink.demodulate(ctx, tag),
            (EventType::Decode, _) => coding::decode(ctx, self.decoder.as_mut(), tag),
            (EventType::Encode, _) => coding::encode(ctx, self.encoder.as_mut(), tag),
            (EventType::Modulate, _) => transmit::modulate(ctx, &self.table, tag),
            (EventType::InverseFft, _) => transmit::inverse_fft(ctx, &mut self.ofdm, tag),
            _ => false,
        }
    }

    /// Execute one dequeued event and publish its completion. An error
    /// means the completion was lost.
    pub fn process(&mut self, ctx: &StageContext, event: Event, producer: &Producer) -> Result<(), EngineError> {
        if !event.event_type.is_stage() {
            warn!("Worker {}: ignoring {:?} for {:?}", self.id, event.event_type, event.tag);
            return Ok(());
        }
        trace!("Worker {}: {:?} {:?}", self.id, event.event_type, event.tag);
        let start = Instant::now();
        if !self.dispatch(ctx, event) {
            warn!(
                "Worker {}: {:?} does not apply to {:?}, no output produced",
                self.id, event.event_type, event.tag
            );
        }
        let stat = &mut self.durations[event.event_type as usize];
        stat.task_count += 1;
        stat.task_duration[0] += start.elapsed();
        producer.publish(event)
    }

    /// Hand the per-stage timing to the stats sink
    fn report(&self, ctx: &StageContext) {
        for event_type in EventType::STAGES {
            let stat = &self.durations[event_type as usize];
            if stat.task_count > 0 {
                ctx.stats.record_durations(self.id, event_type, stat);
            }
        }
    }
}

fn pin_to_core(id: usize, config: &Config) {
    let core = config.core_offset + id;
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|c| c.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        debug!("Worker {} pinned to core {}", id, core);
    } else {
        warn!("Worker {} could not be pinned to core {}", id, core);
    }
}

/// A worker thread of the engine
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start worker `id` polling `work` until `running` is cleared
    pub fn spawn(
        id: usize,
        shared: Arc<Shared>,
        mut state: WorkerState,
        work: Receiver<Event>,
        producer: Producer,
        running: Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                if shared.config.pin_workers {
                    pin_to_core(id, &shared.config);
                }
                let ctx = shared.context();
                info!("Worker {} started", id);

                // Busy poll: no sleep between misses
                while running.load(Ordering::Acquire) {
                    match work.try_recv() {
                        Ok(event) => {
                            if let Err(e) = state.process(&ctx, event, &producer) {
                                error!("Worker {}: {}, halting the pool", id, e);
                                running.store(false, Ordering::Release);
                                break;
                            }
                        }
                        Err(TryRecvError::Empty) => std::hint::spin_loop(),
                        Err(TryRecvError::Disconnected) => break,
                    }
                }

                state.report(&ctx);
                info!("Worker {} stopped", id);
            })
            .map_err(EngineError::WorkerSpawn)?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Wait for the worker thread to finish
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}
