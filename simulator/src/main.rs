//! Radio resource scheduler simulator
//!
//! Runs one configured scheduler over a scenario frame by frame and reports
//! what every frame placed.

mod config;
mod simulation;
mod traffic;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::SimulatorConfig;
use simulation::Simulation;

/// Frame-by-frame scheduler simulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the scenario file (YAML or TOML)
    #[arg(short, long, default_value = "scenario.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Frames to simulate, overriding the scenario
    #[arg(short, long)]
    frames: Option<u32>,

    /// Traffic seed, overriding the scenario
    #[arg(long)]
    seed: Option<u64>,

    /// Write one JSON report per frame to this file
    #[arg(short, long)]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Configuration file: {}", args.config);
    let mut config = SimulatorConfig::from_file(&args.config)?;
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let mut simulation = Simulation::new(&config)?;
    info!("Scenario:");
    info!("  Strategy: {} at {:?}", simulation.strategy_name(), config.scheduler.spot);
    info!("  Stations: {}", config.registry.stations.len());
    info!("  Traffic sources: {}", config.traffic.len());
    info!(
        "  Map: {} subchannels x {} slots x {} layers, {} s",
        config.frame.sub_channels, config.frame.time_slots, config.frame.spatial_layers, config.frame.slot_length
    );
    info!("  Frames: {}", config.frames);

    let mut output = match &args.output {
        Some(path) => Some(BufWriter::new(File::create(path).with_context(|| format!("creating {}", path))?)),
        None => None,
    };

    let mut pacing = (config.frame_interval_ms > 0)
        .then(|| tokio::time::interval(tokio::time::Duration::from_millis(config.frame_interval_ms)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    for frame_nr in 0..config.frames {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                warn!("Received shutdown signal after {} frames", frame_nr);
                break;
            }
            _ = async {
                match pacing.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => tokio::task::yield_now().await,
                }
            } => {}
        }

        let report = simulation.run_frame(frame_nr);
        if let Some(out) = output.as_mut() {
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    if let Some(mut out) = output {
        out.flush()?;
    }

    let summary = simulation.summary();
    info!("Simulation finished:");
    info!("  Frames: {}", summary.frames);
    info!("  Arrived: {} bits", summary.arrived_bits);
    info!("  Scheduled: {} bits", summary.scheduled_bits);
    info!("  Dropped PDUs: {}", summary.dropped_pdus);
    info!("  Mean resource usage: {:.3}", summary.mean_resource_usage);
    Ok(())
}
