//! Engine Lifecycle
//!
//! Owns the frame-window buffers, queues and worker pool. The conductor
//! admits frames, fills their inputs, enqueues work and collects
//! completions through this type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use common::{Config, Event, EventType, SymbolRole, WorkTag};
use interfaces::{CodecFactory, InterfaceError, StatsSink};

use crate::buffers::{FrameBuffers, FrameWindow};
use crate::phy::StageContext;
use crate::queue::EventQueues;
use crate::reference::ReferenceSignals;
use crate::worker::{Worker, WorkerState};
use crate::EngineError;

/// State shared read-only (apart from buffer rows) by every worker
pub struct Shared {
    pub config: Config,
    pub buffers: FrameBuffers,
    pub reference: ReferenceSignals,
    pub stats: Arc<dyn StatsSink>,
}

impl Shared {
    pub fn context(&self) -> StageContext<'_> {
        StageContext {
            config: &self.config,
            buffers: &self.buffers,
            reference: &self.reference,
            stats: self.stats.as_ref(),
        }
    }
}

/// Running baseband engine
pub struct Engine {
    shared: Arc<Shared>,
    queues: EventQueues,
    window: FrameWindow,
    running: Arc<AtomicBool>,
    workers: Vec<Worker>,
}

fn check_codec(codec: &dyn CodecFactory, config: &Config) -> Result<(), InterfaceError> {
    for code in [&config.ul_code, &config.dl_code] {
        let actual = codec.encoded_len(code.info_bits);
        if actual != code.encoded_bits {
            return Err(InterfaceError::BufferSize {
                expected: code.encoded_bits,
                actual,
            });
        }
    }
    Ok(())
}

/// Whether the tag of a stage event addresses units that exist under
/// `config`. Role mismatches are left to the handlers.
fn tag_in_range(config: &Config, event: &Event) -> bool {
    let tag = event.tag;
    let Some(role) = config.frame.role(tag.symbol_id()) else {
        return false;
    };
    let (unit, sub) = (tag.unit_id(), tag.sub_id());
    match event.event_type {
        EventType::FftPilot | EventType::FftData => match role {
            SymbolRole::Downlink => unit < config.ue_ant_num && sub == 0,
            _ => unit < config.bs_ant_num && sub == 0,
        },
        EventType::Demodulate => match role {
            SymbolRole::Downlink => unit < config.ue_ant_num && sub == 0,
            _ => unit == 0 && sub < config.ofdm_data_num && sub % config.demul_block_size == 0,
        },
        EventType::Decode => {
            let code = match role {
                SymbolRole::Downlink => &config.dl_code,
                _ => &config.ul_code,
            };
            unit < config.ue_ant_num && sub < code.blocks_per_symbol
        }
        EventType::Encode | EventType::Modulate | EventType::InverseFft => unit < config.ue_num && sub == 0,
        _ => true,
    }
}

impl Engine {
    /// Build buffers and reference signals and start the worker pool
    pub fn new(
        config: Config,
        codec: Arc<dyn CodecFactory>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, EngineError> {
        check_codec(codec.as_ref(), &config)?;

        let buffers = FrameBuffers::new(&config);
        let reference = ReferenceSignals::new(&config, codec.as_ref());
        let queues = EventQueues::new(config.queue_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let window = FrameWindow::new(config.frame_window);
        let worker_num = config.worker_num;
        let shared = Arc::new(Shared {
            config,
            buffers,
            reference,
            stats,
        });

        let mut engine = Self {
            shared,
            queues,
            window,
            running,
            workers: Vec::with_capacity(worker_num),
        };
        for id in 0..worker_num {
            let state = WorkerState::new(id, &engine.shared.config, codec.encoder(), codec.decoder());
            let worker = Worker::spawn(
                id,
                Arc::clone(&engine.shared),
                state,
                engine.queues.work_receiver(),
                engine.queues.producer(),
                Arc::clone(&engine.running),
            )?;
            engine.workers.push(worker);
        }

        info!(
            "Engine started: {} workers, window {}, frame {}",
            worker_num,
            engine.shared.config.frame_window,
            engine.shared.config.frame.schedule()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn buffers(&self) -> &FrameBuffers {
        &self.shared.buffers
    }

    pub fn reference(&self) -> &ReferenceSignals {
        &self.shared.reference
    }

    pub fn stats(&self) -> &dyn StatsSink {
        self.shared.stats.as_ref()
    }

    /// Claim the window slot of `frame_id` and reset its accumulators.
    /// Must precede every enqueue for the frame.
    pub fn admit_frame(&mut self, frame_id: u64) -> Result<(), EngineError> {
        if frame_id > WorkTag::MAX_FRAME {
            return Err(EngineError::FrameOutOfRange(frame_id));
        }
        self.window.admit(frame_id)?;
        // SAFETY: the previous occupant retired and nothing of this frame
        // has been queued yet
        unsafe { self.shared.buffers.reset_accumulators(frame_id) };
        self.shared.stats.begin_frame(frame_id);
        debug!("Admitted frame {} into slot {}", frame_id, self.shared.config.frame_slot(frame_id));
        Ok(())
    }

    /// Report the frame's diagnostics and release its slot. Every task of
    /// the frame must have completed.
    pub fn retire_frame(&mut self, frame_id: u64) -> Result<(), EngineError> {
        if !self.window.is_in_flight(frame_id) {
            return Err(EngineError::NotInFlight(frame_id));
        }
        // SAFETY: the frame is drained, no worker touches its slot
        unsafe { self.shared.buffers.report_diagnostics(frame_id, self.shared.stats.as_ref()) };
        self.window.retire(frame_id)?;
        debug!("Retired frame {}", frame_id);
        Ok(())
    }

    /// Release the slot of a frame that failed part way. Its diagnostics
    /// are dropped.
    pub fn abandon_frame(&mut self, frame_id: u64) -> Result<(), EngineError> {
        self.window.retire(frame_id)?;
        debug!("Abandoned frame {}", frame_id);
        Ok(())
    }

    pub fn is_in_flight(&self, frame_id: u64) -> bool {
        self.window.is_in_flight(frame_id)
    }

    /// False once shut down or after a worker halted the pool
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueue one unit of work for an admitted frame. Stage events must
    /// address units that exist in the configuration.
    pub fn enqueue(&self, event: Event) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::WorkersHalted);
        }
        let frame_id = event.tag.frame_id();
        if !self.window.is_in_flight(frame_id) {
            return Err(EngineError::NotInFlight(frame_id));
        }
        if event.event_type.is_stage() && !tag_in_range(&self.shared.config, &event) {
            return Err(EngineError::TagOutOfRange(event.event_type, event.tag));
        }
        self.queues.submit(event)
    }

    pub fn try_recv_completion(&self) -> Option<Event> {
        self.queues.try_completion()
    }

    /// Next completion, waiting up to `timeout`. Completions published
    /// before the pool halted are still delivered.
    pub fn recv_completion_timeout(&self, timeout: Duration) -> Result<Option<Event>, EngineError> {
        match self.queues.completion_timeout(timeout)? {
            None if !self.is_running() => Err(EngineError::WorkersHalted),
            done => Ok(done),
        }
    }

    /// Clear the running flag and join every worker
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            let id = worker.id();
            if worker.join().is_err() {
                error!("Worker {} terminated abnormally", id);
            }
        }
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
