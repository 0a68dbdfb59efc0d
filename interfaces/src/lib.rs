//! External Collaborator Interfaces
//!
//! Seams between the baseband engine and the components it treats as
//! opaque: the forward-error-correction codec and the statistics sink.

pub mod fec;
pub mod stats;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    BufferSize { expected: usize, actual: usize },
}

pub use fec::{CodecFactory, Decoder, Encoder, RepetitionCodec};
pub use stats::{DurationStat, DurationSummary, PhyStats, StatsSink, DURATION_PHASES};
