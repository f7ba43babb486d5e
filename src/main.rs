use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use boxvision::calibration::FileCalibrationStore;
use boxvision::clock::SystemClock;
use boxvision::config::BoxVisionConfig;
use boxvision::frame::FrameSource;
use boxvision::output::{test_pattern, OutputStatusEncoder};
use boxvision::pipeline::{BoxMeasurementPipeline, OperatorCommand};
use boxvision::sources::{ImageFileSource, SyntheticSceneSource};
use boxvision::transport::{open_device, LogSink, Protocol, StatusTransmitter};

#[derive(Parser)]
#[command(name = "boxvision")]
#[command(about = "Box size classification with hardware status output")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "boxvision.toml")]
    config: String,

    /// Camera device index (requires the `camera` feature)
    #[arg(short = 'd', long, default_value = "0")]
    camera_device: u32,

    /// Process a single image file
    #[arg(long, conflicts_with_all = ["images", "simulate"])]
    image: Option<PathBuf>,

    /// Process every image in a directory
    #[arg(long, conflicts_with = "simulate")]
    images: Option<PathBuf>,

    /// Use a synthetic scene; optional frame count (0 = unlimited)
    #[arg(long, num_args = 0..=1, default_missing_value = "0")]
    simulate: Option<u64>,

    /// Reference object size in cm
    #[arg(long)]
    reference: Option<f64>,

    /// Calibration file path
    #[arg(long)]
    calibration_file: Option<String>,

    /// Ignore any stored calibration
    #[arg(long)]
    recalibrate: bool,

    /// Device receiving status records (e.g. /dev/ttyACM0)
    #[arg(long)]
    device: Option<String>,

    /// Wire protocol for the device: line or packed
    #[arg(long)]
    protocol: Option<String>,

    /// Cycle the fixed test pattern through the sinks and exit
    #[arg(long)]
    test_output: bool,

    /// Write final statistics as JSON to this path
    #[arg(long)]
    stats_json: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(format!("boxvision={}", log_level))
        .try_init();

    info!("Starting boxvision");

    let mut config = BoxVisionConfig::load(&args.config).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    info!("Configuration loaded successfully");

    let mut transmitter = build_transmitter(&config)?;

    if args.test_output {
        return run_test_output(&config, &mut transmitter).await;
    }

    let mut source = build_source(&args, &config)?;

    let store = FileCalibrationStore::new(&config.calibration.file);
    let mut pipeline = BoxMeasurementPipeline::new(&config, Box::new(store), SystemClock);
    if args.recalibrate {
        pipeline.force_recalibration();
    }

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    spawn_operator_input(command_tx);
    spawn_shutdown_handler(pipeline.running_handle());

    info!("Controls: c recalibrate, +/- angle tolerance, p or space pause, r restart, q quit");
    let result = pipeline
        .run(source.as_mut(), &mut transmitter, &mut command_rx)
        .await;

    let stats = pipeline.statistics();
    stats.log_summary();
    if let Some(path) = &args.stats_json {
        let json = serde_json::to_string_pretty(&stats)?;
        tokio::fs::write(path, json).await?;
        info!("Statistics written to {}", path.display());
    }

    if let Err(e) = &result {
        error!("Pipeline error: {:#}", e);
    }
    result
}

fn apply_overrides(config: &mut BoxVisionConfig, args: &Args) {
    if let Some(reference) = args.reference {
        config.calibration.reference_size_cm = reference;
    }
    if let Some(file) = &args.calibration_file {
        config.calibration.file = file.clone();
    }
    if let Some(device) = &args.device {
        config.output.device = Some(device.clone());
    }
    if let Some(protocol) = &args.protocol {
        config.output.protocol = protocol.clone();
    }
}

/// The log sink is always present; a device that fails to open leaves the
/// system running in simulated output mode.
fn build_transmitter(config: &BoxVisionConfig) -> Result<StatusTransmitter> {
    let mut transmitter = StatusTransmitter::new().with_sink(LogSink);
    if let Some(device) = &config.output.device {
        let protocol: Protocol = config.output.protocol.parse()?;
        match open_device(device, protocol) {
            Ok(sink) => transmitter.add_sink(sink),
            Err(e) => warn!("{:#}; continuing with simulated output", e),
        }
    }
    Ok(transmitter)
}

fn build_source(args: &Args, config: &BoxVisionConfig) -> Result<Box<dyn FrameSource>> {
    if let Some(path) = &args.image {
        return Ok(Box::new(ImageFileSource::open(path)?));
    }
    if let Some(dir) = &args.images {
        return Ok(Box::new(ImageFileSource::open(dir)?));
    }
    if let Some(frames) = args.simulate {
        let source = SyntheticSceneSource::new(1280, 720, frames, rand::random())
            .with_calibration(
                10.0,
                config.calibration.reference_size_cm,
                config.calibration.offset,
            )
            .with_morph_radius(config.vision.morph_radius);
        return Ok(Box::new(source));
    }
    open_camera(args.camera_device)
}

#[cfg(feature = "camera")]
fn open_camera(camera_device: u32) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(boxvision::camera::CameraSource::open(camera_device)?))
}

#[cfg(not(feature = "camera"))]
fn open_camera(_camera_device: u32) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "No frame source: build with --features camera or pass --image, --images or --simulate"
    ))
}

async fn run_test_output(config: &BoxVisionConfig, transmitter: &mut StatusTransmitter) -> Result<()> {
    info!("Cycling output test pattern");
    let mut encoder = OutputStatusEncoder::new(&config.output, Instant::now());
    for (label, word) in test_pattern() {
        info!("Test state: {}", label);
        let frame = encoder.emit_word(word, Instant::now());
        transmitter.send(&frame);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    transmitter.close();
    Ok(())
}

fn spawn_operator_input(commands: mpsc::UnboundedSender<OperatorCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            for command in line.chars().filter_map(OperatorCommand::from_key) {
                if commands.send(command).is_err() {
                    return;
                }
            }
        }
    });
}

fn spawn_shutdown_handler(running: std::sync::Arc<tokio::sync::RwLock<bool>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            *running.write().await = false;
        }
    });
}
