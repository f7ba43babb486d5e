//! Live camera input through nokhwa (feature `camera`).

use anyhow::{anyhow, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use tracing::{debug, error, info, warn};

use crate::error::AcquisitionError;
use crate::frame::{Frame, FrameSource};

pub struct CameraSource {
    camera_id: u32,
    camera: Option<Camera>,
}

impl CameraSource {
    /// Opens the requested camera, falling back to the first one that works.
    pub fn open(camera_id: u32) -> Result<Self> {
        info!("Scanning for available cameras");
        let available = Self::detect_cameras();
        if available.is_empty() {
            return Err(anyhow!("No cameras detected on this system"));
        }
        info!("Found {} camera(s): {:?}", available.len(), available);

        let candidates = if available.contains(&camera_id) {
            vec![camera_id]
        } else {
            available
        };

        for id in candidates {
            match Self::try_open(id) {
                Ok(camera) => {
                    info!("Camera {} opened", id);
                    return Ok(Self {
                        camera_id: id,
                        camera: Some(camera),
                    });
                }
                Err(e) => warn!("Failed to open camera {}: {}", id, e),
            }
        }
        Err(anyhow!("Failed to initialize any available camera"))
    }

    fn try_open(camera_id: u32) -> Result<Camera> {
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let mut camera = Camera::new(CameraIndex::Index(camera_id), requested)?;
        camera.open_stream()?;
        // A first frame proves the stream actually delivers.
        camera.frame()?;
        Ok(camera)
    }

    pub fn detect_cameras() -> Vec<u32> {
        (0..10)
            .filter(|&id| {
                let requested =
                    RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
                Camera::new(CameraIndex::Index(id), requested).is_ok()
            })
            .collect()
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, AcquisitionError> {
        let camera = self.camera.as_mut().ok_or(AcquisitionError::NotOpen)?;
        let buffer = camera.frame().map_err(|e| {
            error!("Camera frame capture failed: {}", e);
            AcquisitionError::Capture(e.to_string())
        })?;
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| AcquisitionError::Capture(e.to_string()))?;

        let (width, height) = (decoded.width(), decoded.height());
        debug!("Captured camera frame: {}x{}", width, height);

        let mut frame = Frame::new(width, height, 3);
        frame.data = decoded.into_raw();
        Ok(Some(frame))
    }

    fn is_open(&self) -> bool {
        self.camera.as_ref().is_some_and(|c| c.is_stream_open())
    }

    fn release(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            match camera.stop_stream() {
                Ok(_) => info!("Camera {} stream stopped", self.camera_id),
                Err(e) => warn!("Error stopping camera stream: {}", e),
            }
        }
    }

    fn describe(&self) -> String {
        format!("camera {}", self.camera_id)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}
