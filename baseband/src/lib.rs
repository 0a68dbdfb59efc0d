//! Massive-MIMO Baseband Engine
//!
//! Frame-pipelined task dispatch for uplink and downlink baseband
//! processing. A conductor admits frames into a window of reusable buffer
//! slots and enqueues work tags; a pool of busy-polling workers runs the
//! stage kernels and reports one completion per unit of work.

pub mod buffers;
pub mod engine;
pub mod loopback;
pub mod phy;
pub mod queue;
pub mod reference;
pub mod worker;

use common::{ConfigError, EventType};
use interfaces::InterfaceError;
use thiserror::Error;

/// Errors surfaced to the conductor
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Frame {frame_id} admitted while frame {occupant} still occupies its slot")]
    WindowOverrun { frame_id: u64, occupant: u64 },

    #[error("Frame {0} is not in flight")]
    NotInFlight(u64),

    #[error("Frame {0} exceeds the work tag frame range")]
    FrameOutOfRange(u64),

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(std::io::Error),

    #[error("Work queue full")]
    QueueFull,

    #[error("Queue disconnected")]
    QueueDisconnected,

    #[error("{0} completions missing after timeout")]
    MissingCompletions(usize),

    #[error("Unexpected completion {0:?} for {1:?}")]
    UnexpectedCompletion(EventType, common::WorkTag),

    #[error("Completion {0:?} for {1:?} rejected by the notification queue")]
    CompletionRejected(EventType, common::WorkTag),

    #[error("{0:?} tag {1:?} is outside the configured bounds")]
    TagOutOfRange(EventType, common::WorkTag),

    #[error("Worker pool halted after a fatal error")]
    WorkersHalted,
}

// Re-export commonly used types
pub use buffers::{BufferLayout, FrameBuffers, FrameWindow};
pub use engine::Engine;
pub use loopback::{Direction, FrameReport, LoopbackConductor};
pub use reference::ReferenceSignals;
