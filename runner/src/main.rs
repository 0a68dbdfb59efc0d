//! Massive-MIMO Baseband Runner
//!
//! Starts the engine, drives loopback frames through it and prints a
//! throughput and link-quality summary.

mod config;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use baseband::{Direction, Engine, FrameReport, LoopbackConductor};
use interfaces::{DurationSummary, PhyStats, RepetitionCodec};

use crate::config::{build_config, load_params, Overrides};

/// Link directions to exercise
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LinkDirection {
    Uplink,
    Downlink,
    Both,
}

impl From<LinkDirection> for Direction {
    fn from(direction: LinkDirection) -> Self {
        match direction {
            LinkDirection::Uplink => Direction::Uplink,
            LinkDirection::Downlink => Direction::Downlink,
            LinkDirection::Both => Direction::Both,
        }
    }
}

/// Massive-MIMO baseband engine in loopback
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Number of frames to run
    #[arg(short, long, default_value = "64")]
    frames: usize,

    /// Link direction
    #[arg(short, long, value_enum, default_value = "both")]
    direction: LinkDirection,

    /// Override the worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Pin workers to consecutive cores
    #[arg(long)]
    pin: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    frames: usize,
    elapsed_ms: f64,
    frames_per_sec: f64,
    completions: usize,
    ul_bytes: usize,
    ul_byte_errors: usize,
    dl_bytes: usize,
    dl_byte_errors: usize,
    last_frame_ul_snr_db: Vec<f32>,
    last_frame_dl_evm: Vec<f32>,
    stages: Vec<DurationSummary>,
}

impl RunSummary {
    fn add(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.completions += report.completions;
        self.ul_bytes += report.ul_bytes;
        self.ul_byte_errors += report.ul_byte_errors;
        self.dl_bytes += report.dl_bytes;
        self.dl_byte_errors += report.dl_byte_errors;
    }
}

fn print_summary(summary: &RunSummary) {
    info!("Loopback summary:");
    info!("  Frames: {} in {:.1} ms ({:.1} frames/s)", summary.frames, summary.elapsed_ms, summary.frames_per_sec);
    info!("  Completions: {}", summary.completions);
    info!("  Uplink: {} bytes, {} errors", summary.ul_bytes, summary.ul_byte_errors);
    info!("  Downlink: {} bytes, {} errors", summary.dl_bytes, summary.dl_byte_errors);
    info!("  Last frame UL SNR (dB): {:?}", summary.last_frame_ul_snr_db);
    info!("  Last frame DL EVM: {:?}", summary.last_frame_dl_evm);
    for stage in &summary.stages {
        info!(
            "  {:?}: {} tasks, {:.2} us avg (phases {:.2}/{:.2}/{:.2} us)",
            stage.event_type,
            stage.task_count,
            stage.avg_total_us,
            stage.avg_phase_us[0],
            stage.avg_phase_us[1],
            stage.avg_phase_us[2]
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting massive-MIMO baseband engine");

    let params = load_params(args.config.as_deref())?;
    let overrides = Overrides {
        worker_num: args.workers,
        pin_workers: args.pin,
    };
    let config = build_config(params, &overrides)?;

    info!("Cell configuration:");
    info!("  Frame: {}", config.frame.schedule());
    info!("  Antennas: {} BS x {} UE", config.bs_ant_num, config.ue_ant_num);
    info!(
        "  Subcarriers: {} of {} ({})",
        config.ofdm_data_num,
        config.ofdm_ca_num,
        config.modulation.name()
    );
    info!("  Window: {} frames, {} workers", config.frame_window, config.worker_num);

    let stats = Arc::new(PhyStats::new(&config));
    let codec = Arc::new(RepetitionCodec::new(config.fec_repetition)?);
    let mut engine = Engine::new(config, codec, stats.clone())?;

    let start = Instant::now();
    let reports = LoopbackConductor::new(&mut engine, args.direction.into()).run(0, args.frames)?;
    let elapsed = start.elapsed();
    engine.shutdown();

    let mut summary = RunSummary::default();
    for report in &reports {
        summary.add(report);
    }
    summary.elapsed_ms = elapsed.as_secs_f64() * 1e3;
    summary.frames_per_sec = summary.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    if let Some(last) = reports.last() {
        summary.last_frame_ul_snr_db = stats.ul_snr(last.frame_id);
        summary.last_frame_dl_evm = stats.dl_evm(last.frame_id);
    }
    summary.stages = stats.durations();

    if summary.ul_byte_errors + summary.dl_byte_errors > 0 {
        warn!(
            "Decoded payload mismatches: {} uplink, {} downlink bytes",
            summary.ul_byte_errors, summary.dl_byte_errors
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    info!("Baseband engine shutdown complete");
    Ok(())
}
