//! Pixel-to-centimeter calibration from the reference object.
//!
//! The scale is `min_edge_px / reference_size_cm - offset`. The offset
//! (28.0 by default) is an empirical correction inherited from the field
//! setup; it is configurable and has no geometric derivation.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::detector::CandidateRectangle;
use crate::error::CalibrationError;
use crate::geometry::edge_lengths;

const SCALE_KEY: &str = "PIXELS_PER_CM";
const TIMESTAMP_KEY: &str = "DATA_CALIBRACAO";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationState {
    pub pixels_per_cm: f64,
    pub calibrated: bool,
    pub reference_size_cm: f64,
}

/// Durable home of the calibrated scale.
pub trait CalibrationStore {
    /// `Ok(None)` when nothing usable is stored.
    fn load(&self) -> Result<Option<f64>, CalibrationError>;

    fn save(&mut self, pixels_per_cm: f64, timestamp: &str) -> Result<(), CalibrationError>;
}

/// Two-line text file: `PIXELS_PER_CM = 42.00` then `DATA_CALIBRACAO = <timestamp>`.
#[derive(Debug, Clone)]
pub struct FileCalibrationStore {
    path: PathBuf,
}

impl FileCalibrationStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn load(&self) -> Result<Option<f64>, CalibrationError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_scale(&content))
    }

    fn save(&mut self, pixels_per_cm: f64, timestamp: &str) -> Result<(), CalibrationError> {
        fs::write(&self.path, format_record(pixels_per_cm, timestamp))?;
        Ok(())
    }
}

pub fn format_record(pixels_per_cm: f64, timestamp: &str) -> String {
    format!("{SCALE_KEY} = {pixels_per_cm:.2}\n{TIMESTAMP_KEY} = {timestamp}\n")
}

/// Reads the scale field only; anything unparseable counts as absent.
pub fn parse_scale(content: &str) -> Option<f64> {
    let line = content.lines().find(|line| line.contains(SCALE_KEY))?;
    let (_, value) = line.split_once('=')?;
    match value.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring malformed calibration value {:?}: {}", value.trim(), e);
            None
        }
    }
}

/// Pure scale computation shared by calibration and tests.
pub fn compute_scale(
    edges_px: (f64, f64),
    reference_size_cm: f64,
    offset: f64,
) -> Result<f64, CalibrationError> {
    if !(reference_size_cm > 0.0) {
        return Err(CalibrationError::InvalidReferenceSize(reference_size_cm));
    }
    let min_edge = edges_px.0.min(edges_px.1);
    if !(min_edge > 0.0) {
        return Err(CalibrationError::DegenerateReference(min_edge));
    }
    let scale = min_edge / reference_size_cm - offset;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(CalibrationError::NonPositiveScale(scale));
    }
    Ok(scale)
}

pub struct CalibrationManager {
    state: CalibrationState,
    offset: f64,
    store: Box<dyn CalibrationStore>,
}

impl CalibrationManager {
    pub fn new(config: &CalibrationConfig, store: Box<dyn CalibrationStore>) -> Self {
        Self {
            state: CalibrationState {
                pixels_per_cm: 0.0,
                calibrated: false,
                reference_size_cm: config.reference_size_cm,
            },
            offset: config.offset,
            store,
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.calibrated
    }

    /// Startup load. A missing, unreadable or non-positive value leaves the
    /// manager uncalibrated.
    pub fn load_persisted(&mut self) -> bool {
        match self.store.load() {
            Ok(Some(value)) if value > 0.0 && value.is_finite() => {
                self.state.pixels_per_cm = value;
                self.state.calibrated = true;
                info!("Calibration loaded: {:.2} px/cm", value);
                true
            }
            Ok(Some(value)) => {
                warn!("Stored calibration {:.2} px/cm is not usable", value);
                false
            }
            Ok(None) => {
                info!("No previous calibration found");
                false
            }
            Err(e) => {
                warn!("Failed to read calibration: {}", e);
                false
            }
        }
    }

    /// Derives the scale from the reference rectangle. On failure the manager
    /// stays uncalibrated and the next reference rectangle retries.
    pub fn calibrate(&mut self, reference: &CandidateRectangle) -> Result<f64, CalibrationError> {
        let scale = compute_scale(
            edge_lengths(&reference.corners),
            self.state.reference_size_cm,
            self.offset,
        )?;

        self.state.pixels_per_cm = scale;
        self.state.calibrated = true;
        info!("System calibrated: {:.2} px/cm", scale);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        if let Err(e) = self.store.save(scale, &timestamp) {
            warn!("Calibration computed but not persisted: {}", e);
        }
        Ok(scale)
    }

    /// Forces recalibration on the next reference rectangle.
    pub fn reset(&mut self) {
        self.state.calibrated = false;
        info!("Calibration reset");
    }
}
