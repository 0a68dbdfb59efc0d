//! Stage Kernels
//!
//! Numerical handlers run by the workers. Each handler resolves its buffer
//! rows from the work tag, reads its producer's output and writes its own.

pub mod coding;
pub mod downlink;
pub mod gather;
pub mod modulation;
pub mod ofdm;
pub mod pilot;
pub mod transmit;
pub mod uplink;

use common::Config;
use interfaces::StatsSink;

use crate::buffers::FrameBuffers;
use crate::reference::ReferenceSignals;

// Re-export commonly used types
pub use modulation::{demodulate_soft, hard_decision, ModulationTable};
pub use ofdm::OfdmProcessor;
pub use downlink::DownlinkReceiver;
pub use uplink::Demodulator;

/// Read-only state shared by every handler invocation
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a Config,
    pub buffers: &'a FrameBuffers,
    pub reference: &'a ReferenceSignals,
    pub stats: &'a dyn StatsSink,
}

/// Wrap an angle to `(-pi, pi]`
pub fn wrap_phase(theta: f32) -> f32 {
    use std::f32::consts::PI;
    let mut t = theta % (2.0 * PI);
    if t <= -PI {
        t += 2.0 * PI;
    } else if t > PI {
        t -= 2.0 * PI;
    }
    t
}

#[cfg(test)]
pub(crate) mod test_support {
    use common::{Config, ConfigParams};
    use interfaces::{PhyStats, RepetitionCodec};

    use super::StageContext;
    use crate::buffers::FrameBuffers;
    use crate::reference::ReferenceSignals;

    /// Engine state without workers, for driving kernels directly
    pub struct Fixture {
        pub config: Config,
        pub buffers: FrameBuffers,
        pub reference: ReferenceSignals,
        pub stats: PhyStats,
    }

    impl Fixture {
        pub fn small_params() -> ConfigParams {
            ConfigParams {
                frame: "PUUUUGDDD".to_string(),
                bs_ant_num: 8,
                ue_num: 2,
                ofdm_ca_num: 64,
                ofdm_data_start: 8,
                ofdm_data_num: 48,
                cp_len: 16,
                modulation: "QPSK".to_string(),
                demul_block_size: 16,
                frame_window: 4,
                ofdm_pilot_spacing: 8,
                worker_num: 2,
                queue_capacity: 4096,
                ..ConfigParams::default()
            }
        }

        pub fn new(params: ConfigParams) -> Self {
            let config = Config::new(params).unwrap();
            let codec = RepetitionCodec::new(config.fec_repetition).unwrap();
            let reference = ReferenceSignals::new(&config, &codec);
            Self {
                buffers: FrameBuffers::new(&config),
                stats: PhyStats::new(&config),
                reference,
                config,
            }
        }

        pub fn ctx(&self) -> StageContext<'_> {
            StageContext {
                config: &self.config,
                buffers: &self.buffers,
                reference: &self.reference,
                stats: &self.stats,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(0.5) - 0.5).abs() < 1e-6);
        assert!((wrap_phase(2.0 * PI - 0.1) + 0.1).abs() < 1e-5);
        assert!((wrap_phase(-2.0 * PI + 0.1) - 0.1).abs() < 1e-5);
        assert!((wrap_phase(-PI) - PI).abs() < 1e-5);
    }
}
