use anyhow::{anyhow, Result};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb};

use crate::error::AcquisitionError;

/// Raw raster handed to the pipeline by an acquisition collaborator.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        let size = (width * height * channels) as usize;
        Self {
            data: vec![0u8; size],
            width,
            height,
            channels,
        }
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            data: rgb.into_raw(),
            width,
            height,
            channels: 3,
        }
    }

    pub fn to_image(&self) -> Result<DynamicImage> {
        match self.channels {
            3 => {
                let buffer = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(
                    self.width,
                    self.height,
                    self.data.clone(),
                )
                .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}x3", self.width, self.height))?;
                Ok(DynamicImage::ImageRgb8(buffer))
            }
            1 => {
                let buffer = ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(
                    self.width,
                    self.height,
                    self.data.clone(),
                )
                .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}x1", self.width, self.height))?;
                Ok(DynamicImage::ImageLuma8(buffer))
            }
            other => Err(anyhow!("Unsupported channel count: {}", other)),
        }
    }

    pub fn to_luma(&self) -> Result<GrayImage> {
        Ok(self.to_image()?.to_luma8())
    }
}

/// Producer of frames. Implementations own the acquisition resource.
pub trait FrameSource {
    /// Next frame, or `Ok(None)` once a finite source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, AcquisitionError>;

    /// Whether the underlying resource is present and open.
    fn is_open(&self) -> bool;

    /// Restart a finite source. Returns false when the source cannot rewind.
    fn rewind(&mut self) -> bool {
        false
    }

    /// Release the acquisition resource. Must be safe to call twice.
    fn release(&mut self);

    fn describe(&self) -> String;
}
