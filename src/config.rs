use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::detector::{MAX_ANGLE_TOLERANCE, MIN_ANGLE_TOLERANCE};

/// Prefix for environment overrides, e.g. `BOXVISION__DETECTION__MAX_ANGLE_DEVIATION=12`.
pub const ENV_PREFIX: &str = "BOXVISION";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxVisionConfig {
    pub vision: VisionConfig,
    pub detection: DetectionConfig,
    pub calibration: CalibrationConfig,
    pub classification: ClassificationConfig,
    pub stabilization: StabilizationConfig,
    pub output: OutputConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Frames wider than this are downscaled before edge detection
    pub max_frame_width: u32,
    /// Gaussian blur sigma applied before Canny
    pub blur_sigma: f32,
    /// Spread around the median intensity used for the Canny thresholds
    pub canny_sigma: f32,
    /// Radius of the square structuring element for close/dilate (2 => 5x5)
    pub morph_radius: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum contour area in px^2
    pub min_contour_area: f64,
    /// Maximum tilt from either image axis, in degrees
    pub max_angle_deviation: f64,
    /// Minimum rectangularity score in [0, 1]
    pub min_rectangle_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Side of the square reference object in cm
    pub reference_size_cm: f64,
    /// Empirical correction subtracted from the raw px/cm ratio
    pub offset: f64,
    /// Where the calibrated scale is persisted
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Allowed deviation per axis, in cm
    pub tolerance_cm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizationConfig {
    /// Number of per-frame majority labels kept
    pub history_capacity: usize,
    /// Consecutive frames needed before a reading counts as confirmed
    pub confirm_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Minimum time between two status emissions
    pub emit_interval_ms: u64,
    /// Liveness window of the encoder
    pub operational_timeout_ms: u64,
    /// Number of emitted status bytes kept for inspection
    pub history_capacity: usize,
    /// Frames without any valid box before the pipeline is flagged as stuck
    pub processing_stall_frames: u64,
    /// Wire protocol used by device sinks: "line" or "packed"
    pub protocol: String,
    /// Optional device path (e.g. /dev/ttyACM0) receiving status records
    pub device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Delay between frames in milliseconds
    pub processing_interval_ms: u64,
    /// Rewind finite sources when they run out of frames
    pub loop_source: bool,
    /// Log throughput every this many frames
    pub stats_every_frames: u64,
}

impl Default for BoxVisionConfig {
    fn default() -> Self {
        Self {
            vision: VisionConfig {
                max_frame_width: 1280,
                blur_sigma: 1.7,
                canny_sigma: 0.33,
                morph_radius: 2,
            },
            detection: DetectionConfig {
                min_contour_area: 1000.0,
                max_angle_deviation: 10.0,
                min_rectangle_score: 0.1,
            },
            calibration: CalibrationConfig {
                reference_size_cm: 2.0,
                offset: 28.0,
                file: "calibracao.txt".to_string(),
            },
            classification: ClassificationConfig { tolerance_cm: 3.0 },
            stabilization: StabilizationConfig {
                history_capacity: 20,
                confirm_count: 3,
            },
            output: OutputConfig {
                emit_interval_ms: 500,
                operational_timeout_ms: 2000,
                history_capacity: 5,
                processing_stall_frames: 100,
                protocol: "line".to_string(),
                device: None,
            },
            performance: PerformanceConfig {
                processing_interval_ms: 0,
                loop_source: true,
                stats_every_frames: 100,
            },
        }
    }
}

impl OutputConfig {
    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }

    pub fn operational_timeout(&self) -> Duration {
        Duration::from_millis(self.operational_timeout_ms)
    }
}

impl BoxVisionConfig {
    /// Loads the config file, creating it with defaults when missing, then
    /// applies `BOXVISION__*` environment overrides on top.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let default_config = Self::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing default config to {}", path.display()))?;
            info!("Wrote default configuration to {}", path.display());
        }

        let layered = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("reading config {}", path.display()))?;

        let config: Self = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.calibration.reference_size_cm <= 0.0 {
            bail!("calibration.reference_size_cm must be positive");
        }
        if self.classification.tolerance_cm < 0.0 {
            bail!("classification.tolerance_cm must not be negative");
        }
        if !(0.0..=1.0).contains(&self.detection.min_rectangle_score) {
            bail!("detection.min_rectangle_score must be within [0, 1]");
        }
        if !(MIN_ANGLE_TOLERANCE..=MAX_ANGLE_TOLERANCE).contains(&self.detection.max_angle_deviation) {
            bail!(
                "detection.max_angle_deviation must be within [{}, {}]",
                MIN_ANGLE_TOLERANCE,
                MAX_ANGLE_TOLERANCE
            );
        }
        if self.stabilization.history_capacity == 0 || self.output.history_capacity == 0 {
            bail!("history capacities must be at least 1");
        }
        if self.output.emit_interval_ms == 0 || self.output.operational_timeout_ms == 0 {
            bail!("output intervals must be positive");
        }
        if self.vision.max_frame_width == 0 {
            bail!("vision.max_frame_width must be positive");
        }
        match self.output.protocol.as_str() {
            "line" | "packed" => {}
            other => bail!("output.protocol must be \"line\" or \"packed\", got {other:?}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BoxVisionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.output.emit_interval(), Duration::from_millis(500));
        assert_eq!(config.output.operational_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_unknown_protocol() {
        let mut config = BoxVisionConfig::default();
        config.output.protocol = "json".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn angle_tolerance_matches_runtime_range() {
        let mut config = BoxVisionConfig::default();
        config.detection.max_angle_deviation = 0.0;
        assert!(config.validate().is_err());
        config.detection.max_angle_deviation = 45.5;
        assert!(config.validate().is_err());

        for degrees in [MIN_ANGLE_TOLERANCE, MAX_ANGLE_TOLERANCE] {
            config.detection.max_angle_deviation = degrees;
            assert!(config.validate().is_ok());
        }
    }

    #[tokio::test]
    async fn load_creates_default_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boxvision.toml");

        let config = BoxVisionConfig::load(&path).await?;
        assert!(path.exists());
        assert_eq!(config.detection.max_angle_deviation, 10.0);
        assert_eq!(config.calibration.offset, 28.0);
        Ok(())
    }

    #[tokio::test]
    async fn load_reads_saved_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boxvision.toml");

        let mut config = BoxVisionConfig::default();
        config.classification.tolerance_cm = 2.5;
        config.output.protocol = "packed".to_string();
        config.save(&path).await?;

        let loaded = BoxVisionConfig::load(&path).await?;
        assert_eq!(loaded.classification.tolerance_cm, 2.5);
        assert_eq!(loaded.output.protocol, "packed");
        Ok(())
    }
}
