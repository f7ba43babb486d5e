use serde::Serialize;
use tracing::warn;

use crate::config::OutputConfig;

/// Per-frame error flags. `has_error` drives the error bit of the status word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemErrorFlags {
    pub camera_error: bool,
    pub timeout_error: bool,
    pub processing_error: bool,
    /// Reserved for the hardware map; nothing raises it today.
    pub calibration_error: bool,
}

impl SystemErrorFlags {
    pub fn has_error(&self) -> bool {
        self.camera_error || self.timeout_error || self.processing_error || self.calibration_error
    }

    pub fn describe(&self) -> String {
        let mut active = Vec::new();
        if self.camera_error {
            active.push("camera");
        }
        if self.timeout_error {
            active.push("timeout");
        }
        if self.processing_error {
            active.push("processing");
        }
        if self.calibration_error {
            active.push("calibration");
        }
        if active.is_empty() {
            "none".to_string()
        } else {
            active.join(",")
        }
    }
}

/// Recomputes the error flags once per frame, after classification.
pub struct SystemErrorMonitor {
    stall_frames: u64,
    flags: SystemErrorFlags,
}

impl SystemErrorMonitor {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            stall_frames: config.processing_stall_frames,
            flags: SystemErrorFlags::default(),
        }
    }

    /// `valid_classifications` is the count of valid classifications ever
    /// recorded, so the processing flag only fires while the line has never
    /// produced a reading.
    pub fn evaluate(
        &mut self,
        camera_open: bool,
        encoder_operational: bool,
        frames_processed: u64,
        valid_classifications: u64,
    ) -> SystemErrorFlags {
        let flags = SystemErrorFlags {
            camera_error: !camera_open,
            timeout_error: !encoder_operational,
            processing_error: frames_processed > self.stall_frames && valid_classifications == 0,
            calibration_error: false,
        };

        if flags.has_error() && flags != self.flags {
            warn!("System error flags raised: {}", flags.describe());
        }
        self.flags = flags;
        flags
    }

    pub fn flags(&self) -> SystemErrorFlags {
        self.flags
    }
}
