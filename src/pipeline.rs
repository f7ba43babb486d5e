use anyhow::Result;
use image::GrayImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::calibration::{CalibrationManager, CalibrationState, CalibrationStore};
use crate::classifier::{BoxClassifier, BoxMeasurement, BoxType};
use crate::clock::{Clock, SystemClock};
use crate::config::{BoxVisionConfig, PerformanceConfig};
use crate::detector::AlignedRectangleDetector;
use crate::frame::{Frame, FrameSource};
use crate::monitor::{SystemErrorFlags, SystemErrorMonitor};
use crate::output::{OutputStatusEncoder, StatusFrame, StatusWord};
use crate::preprocess::EdgePreprocessor;
use crate::stabilizer::{StabilizationSnapshot, StabilizationTracker};
use crate::transport::StatusTransmitter;

/// Operator controls accepted while the loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Recalibrate,
    WidenTolerance,
    NarrowTolerance,
    TogglePause,
    Restart,
    Quit,
}

impl OperatorCommand {
    /// Keyboard mapping used by the interactive binary.
    pub fn from_key(key: char) -> Option<Self> {
        match key.to_ascii_lowercase() {
            'c' => Some(OperatorCommand::Recalibrate),
            '+' => Some(OperatorCommand::WidenTolerance),
            '-' => Some(OperatorCommand::NarrowTolerance),
            ' ' | 'p' => Some(OperatorCommand::TogglePause),
            'r' => Some(OperatorCommand::Restart),
            'q' => Some(OperatorCommand::Quit),
            _ => None,
        }
    }
}

/// Lets the first emission through, then at most one per interval.
#[derive(Debug, Clone)]
pub struct EmissionGate {
    interval: Duration,
    last: Option<Instant>,
}

impl EmissionGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Everything that happened to one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_index: u64,
    pub rectangles: usize,
    pub calibrated_now: bool,
    pub measurements: Vec<BoxMeasurement>,
    pub stabilization: StabilizationSnapshot,
    pub errors: SystemErrorFlags,
    pub emitted: Option<StatusFrame>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatistics {
    pub frames_processed: u64,
    pub rectangles_detected: u64,
    pub boxes_measured: u64,
    pub valid_classifications: u64,
    pub calibrations: u64,
    pub emissions: u64,
    pub acquisition_errors: u64,
    pub per_type: BTreeMap<String, u64>,
    pub acceptance_rate: Option<f64>,
    pub calibrated: bool,
    pub pixels_per_cm: f64,
    pub max_angle_deviation: f64,
    pub last_status: Option<StatusWord>,
}

impl RunStatistics {
    pub fn log_summary(&self) {
        info!("📊 Frames processed: {}", self.frames_processed);
        info!("📊 Rectangles detected: {}", self.rectangles_detected);
        info!(
            "📊 Boxes measured: {} ({} valid)",
            self.boxes_measured, self.valid_classifications
        );
        if let Some(rate) = self.acceptance_rate {
            info!("📊 Acceptance rate: {:.1}%", rate * 100.0);
        }
        for (label, count) in &self.per_type {
            info!("📊   {}: {}", label, count);
        }
        if self.calibrated {
            info!("📊 Calibrated at {:.2} px/cm", self.pixels_per_cm);
        } else {
            info!("📊 Not calibrated");
        }
        info!("📊 Final angle tolerance: {:.0}°", self.max_angle_deviation);
        if let Some(word) = self.last_status {
            info!("📊 Final status: {}", word.summary());
        }
    }
}

/// Single owner of the per-session measurement state.
pub struct BoxMeasurementPipeline<C: Clock = SystemClock> {
    preprocessor: EdgePreprocessor,
    detector: AlignedRectangleDetector,
    calibration: CalibrationManager,
    classifier: BoxClassifier,
    stabilizer: StabilizationTracker,
    encoder: OutputStatusEncoder,
    monitor: SystemErrorMonitor,
    gate: EmissionGate,
    stats: RunStatistics,
    performance: PerformanceConfig,
    clock: C,
    paused: bool,
    running: Arc<RwLock<bool>>,
}

impl<C: Clock> BoxMeasurementPipeline<C> {
    /// Builds the pipeline and tries to load a persisted calibration.
    pub fn new(config: &BoxVisionConfig, store: Box<dyn CalibrationStore>, clock: C) -> Self {
        let now = clock.now();
        let mut calibration = CalibrationManager::new(&config.calibration, store);
        calibration.load_persisted();

        Self {
            preprocessor: EdgePreprocessor::new(&config.vision),
            detector: AlignedRectangleDetector::new(&config.detection),
            calibration,
            classifier: BoxClassifier::new(&config.classification),
            stabilizer: StabilizationTracker::new(&config.stabilization),
            encoder: OutputStatusEncoder::new(&config.output, now),
            monitor: SystemErrorMonitor::new(&config.output),
            gate: EmissionGate::new(config.output.emit_interval()),
            stats: RunStatistics::default(),
            performance: config.performance.clone(),
            clock,
            paused: false,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Decodes a raw frame into an edge map, then runs [`Self::process_edges`].
    pub fn process_frame(&mut self, frame: &Frame, camera_open: bool) -> Result<FrameReport> {
        let edge_map = self.preprocessor.process(frame)?;
        debug!(
            "📷 Frame {}x{} -> edge map scale {:.3}",
            frame.width, frame.height, edge_map.scale
        );
        Ok(self.process_edges(&edge_map.edges, camera_open))
    }

    /// One full cycle on a binary edge map.
    pub fn process_edges(&mut self, edges: &GrayImage, camera_open: bool) -> FrameReport {
        self.stats.frames_processed += 1;

        let rectangles = self.detector.detect(edges);
        self.stats.rectangles_detected += rectangles.len() as u64;

        let mut calibrated_now = false;
        let mut measurements = Vec::new();

        // Leftmost rectangle is the reference object by scene contract.
        if let Some((reference, boxes)) = rectangles.split_first() {
            if !self.calibration.is_calibrated() {
                match self.calibration.calibrate(reference) {
                    Ok(_) => {
                        calibrated_now = true;
                        self.stats.calibrations += 1;
                    }
                    Err(e) => warn!("Calibration failed, retrying on next frame: {}", e),
                }
            }

            if self.calibration.is_calibrated() {
                for rect in boxes {
                    let measurement = self.classifier.measure(rect, self.calibration.state());
                    self.stats.boxes_measured += 1;
                    if measurement.valid {
                        self.stats.valid_classifications += 1;
                        *self
                            .stats
                            .per_type
                            .entry(measurement.box_type.label().to_string())
                            .or_insert(0) += 1;
                    }
                    debug!(
                        "📦 {:.1}x{:.1} cm -> {} (valid: {})",
                        measurement.width_cm,
                        measurement.height_cm,
                        measurement.box_type,
                        measurement.valid
                    );
                    measurements.push(measurement);
                }
            }
        }

        let labels: Vec<BoxType> = measurements
            .iter()
            .filter(|m| m.valid)
            .map(|m| m.box_type)
            .collect();
        let stabilization = self.stabilizer.update(&labels);

        let now = self.clock.now();
        let errors = self.monitor.evaluate(
            camera_open,
            self.encoder.is_operational(now),
            self.stats.frames_processed,
            self.stats.valid_classifications,
        );

        let emitted = if self.gate.is_open(now) {
            let detected = stabilization.last_stable_type.is_some();
            let box_type = stabilization.last_stable_type.unwrap_or(BoxType::None);
            let frame = self
                .encoder
                .emit(camera_open, errors.has_error(), detected, box_type, now);
            self.gate.mark(now);
            self.stats.emissions += 1;
            Some(frame)
        } else {
            None
        };

        FrameReport {
            frame_index: self.stats.frames_processed,
            rectangles: rectangles.len(),
            calibrated_now,
            measurements,
            stabilization,
            errors,
            emitted,
        }
    }

    /// Emits the error preset immediately, bypassing the gate.
    pub fn emit_error_state(&mut self) -> StatusFrame {
        let now = self.clock.now();
        let frame = self.encoder.emit_word(StatusWord::failure(), now);
        self.gate.mark(now);
        self.stats.emissions += 1;
        frame
    }

    /// Applies an operator command. Returns false when the loop should stop.
    pub fn apply_command(&mut self, command: OperatorCommand, source: &mut dyn FrameSource) -> bool {
        match command {
            OperatorCommand::Recalibrate => self.force_recalibration(),
            OperatorCommand::WidenTolerance => {
                let degrees = self.detector.widen_tolerance();
                info!("Angle tolerance widened to {:.0}°", degrees);
            }
            OperatorCommand::NarrowTolerance => {
                let degrees = self.detector.narrow_tolerance();
                info!("Angle tolerance narrowed to {:.0}°", degrees);
            }
            OperatorCommand::TogglePause => {
                self.paused = !self.paused;
                info!("Processing {}", if self.paused { "paused" } else { "resumed" });
            }
            OperatorCommand::Restart => {
                if source.rewind() {
                    info!("Source {} restarted", source.describe());
                } else {
                    warn!("Source {} cannot be restarted", source.describe());
                }
            }
            OperatorCommand::Quit => {
                info!("Quit requested");
                return false;
            }
        }
        true
    }

    pub fn force_recalibration(&mut self) {
        self.calibration.reset();
    }

    /// Drives frames from `source` until quit, end of stream or an
    /// acquisition error. The source is released and the transmitter closed
    /// on every exit path.
    pub async fn run(
        &mut self,
        source: &mut dyn FrameSource,
        transmitter: &mut StatusTransmitter,
        commands: &mut mpsc::UnboundedReceiver<OperatorCommand>,
    ) -> Result<()> {
        info!("Starting measurement loop on {}", source.describe());
        *self.running.write().await = true;

        let result = self.drive(source, transmitter, commands).await;

        source.release();
        transmitter.close();
        *self.running.write().await = false;

        match &result {
            Ok(()) => info!(
                "Measurement loop stopped after {} frames",
                self.stats.frames_processed
            ),
            Err(e) => error!("Measurement loop aborted: {:#}", e),
        }
        result
    }

    async fn drive(
        &mut self,
        source: &mut dyn FrameSource,
        transmitter: &mut StatusTransmitter,
        commands: &mut mpsc::UnboundedReceiver<OperatorCommand>,
    ) -> Result<()> {
        let mut frames_since_rewind = 0u64;
        let mut window_frames = 0u64;
        let mut last_stats_time = Instant::now();

        loop {
            if !*self.running.read().await {
                break;
            }

            while let Ok(command) = commands.try_recv() {
                if !self.apply_command(command, source) {
                    return Ok(());
                }
            }

            if self.paused {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if self.performance.loop_source && frames_since_rewind > 0 && source.rewind() {
                        debug!("Source exhausted, rewinding");
                        frames_since_rewind = 0;
                        continue;
                    }
                    info!("Source {} exhausted", source.describe());
                    break;
                }
                Err(e) => {
                    self.stats.acquisition_errors += 1;
                    let status = self.emit_error_state();
                    transmitter.send(&status);
                    return Err(e.into());
                }
            };
            frames_since_rewind += 1;

            let report = match self.process_frame(&frame, source.is_open()) {
                Ok(report) => report,
                Err(e) => {
                    let status = self.emit_error_state();
                    transmitter.send(&status);
                    return Err(e);
                }
            };
            if let Some(status) = &report.emitted {
                transmitter.send(status);
            }

            window_frames += 1;
            if self.performance.stats_every_frames > 0
                && window_frames >= self.performance.stats_every_frames
            {
                let fps = window_frames as f64 / last_stats_time.elapsed().as_secs_f64().max(1e-6);
                info!(
                    "Processed {} frames, current FPS: {:.2}",
                    self.stats.frames_processed, fps
                );
                window_frames = 0;
                last_stats_time = Instant::now();
            }

            if self.performance.processing_interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.performance.processing_interval_ms))
                    .await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Handle that stops the loop when set to false.
    pub fn running_handle(&self) -> Arc<RwLock<bool>> {
        Arc::clone(&self.running)
    }

    pub fn statistics(&self) -> RunStatistics {
        let mut stats = self.stats.clone();
        let state = self.calibration.state();
        stats.calibrated = state.calibrated;
        stats.pixels_per_cm = state.pixels_per_cm;
        stats.max_angle_deviation = self.detector.max_angle_deviation();
        stats.last_status = (stats.emissions > 0).then(|| self.encoder.word());
        stats.acceptance_rate = (stats.boxes_measured > 0)
            .then(|| stats.valid_classifications as f64 / stats.boxes_measured as f64);
        stats
    }

    pub fn calibration_state(&self) -> &CalibrationState {
        self.calibration.state()
    }

    pub fn encoder(&self) -> &OutputStatusEncoder {
        &self.encoder
    }
}
