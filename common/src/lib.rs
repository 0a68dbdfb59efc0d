//! Common Types and Configuration
//!
//! Shared work tags, frame layout and validated configuration used by the
//! baseband engine and its collaborators.

pub mod config;
pub mod frame;
pub mod types;
pub mod utils;

use thiserror::Error;

/// Errors raised while building the frame-invariant configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid frame schedule: {0}")]
    InvalidFrame(String),

    #[error("Work tag field {0} out of range: {1}")]
    TagOutOfRange(&'static str, u64),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

// Re-export commonly used items
pub use config::{CodeBlockConfig, Config, ConfigParams, SCS_PER_CACHELINE, TRANSPOSE_BLOCK_SIZE};
pub use frame::FrameLayout;
pub use types::*;
pub use utils::*;
