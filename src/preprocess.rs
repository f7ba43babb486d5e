use anyhow::Result;
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::{edges, filter, morphology};
use tracing::debug;

use crate::config::VisionConfig;
use crate::frame::Frame;

/// Binary edge map plus the downscale factor applied to produce it.
#[derive(Debug, Clone)]
pub struct EdgeMap {
    pub edges: GrayImage,
    /// Ratio between edge-map pixels and source-frame pixels (<= 1.0).
    pub scale: f64,
}

pub struct EdgePreprocessor {
    max_frame_width: u32,
    blur_sigma: f32,
    canny_sigma: f32,
    morph_radius: u8,
}

impl EdgePreprocessor {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            max_frame_width: config.max_frame_width,
            blur_sigma: config.blur_sigma,
            canny_sigma: config.canny_sigma,
            morph_radius: config.morph_radius,
        }
    }

    pub fn process(&self, frame: &Frame) -> Result<EdgeMap> {
        let gray = frame.to_luma()?;
        Ok(self.process_gray(gray))
    }

    pub fn process_gray(&self, gray: GrayImage) -> EdgeMap {
        let (width, height) = gray.dimensions();
        let (gray, scale) = if width > self.max_frame_width {
            let scale = f64::from(self.max_frame_width) / f64::from(width);
            let new_height = ((f64::from(height) * scale) as u32).max(1);
            (
                imageops::resize(&gray, self.max_frame_width, new_height, FilterType::Triangle),
                scale,
            )
        } else {
            (gray, 1.0)
        };

        let blurred = if self.blur_sigma > 0.0 {
            filter::gaussian_blur_f32(&gray, self.blur_sigma)
        } else {
            gray
        };

        let median = f32::from(median_intensity(&blurred));
        let lower = ((1.0 - self.canny_sigma) * median).clamp(0.0, 255.0);
        // flat frames would otherwise turn every zero-gradient pixel into an edge
        let upper = ((1.0 + self.canny_sigma) * median).clamp(1.0, 255.0);
        let mut edged = edges::canny(&blurred, lower, upper);

        if self.morph_radius > 0 {
            edged = morphology::close(&edged, Norm::LInf, self.morph_radius);
            edged = morphology::dilate(&edged, Norm::LInf, self.morph_radius);
        }

        debug!(
            "Edge map {}x{} (scale {:.3}, canny {:.0}/{:.0})",
            edged.width(),
            edged.height(),
            scale,
            lower,
            upper
        );

        EdgeMap { edges: edged, scale }
    }
}

/// Median of an 8-bit image via its histogram.
pub fn median_intensity(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.pixels() {
        histogram[pixel[0] as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let half = total.div_ceil(2);
    let mut seen = 0;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= half {
            return value as u8;
        }
    }
    255
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoxVisionConfig;
    use image::Luma;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    #[test]
    fn median_of_two_tone_image() {
        let mut image = GrayImage::from_pixel(10, 10, Luma([20]));
        draw_filled_rect_mut(&mut image, Rect::at(0, 0).of_size(10, 4), Luma([200]));
        assert_eq!(median_intensity(&image), 20);
        assert_eq!(median_intensity(&GrayImage::new(0, 0)), 0);
    }

    #[test]
    fn filled_rectangle_produces_edges_on_its_border() {
        let preprocessor = EdgePreprocessor::new(&BoxVisionConfig::default().vision);
        let mut image = GrayImage::from_pixel(200, 150, Luma([30]));
        draw_filled_rect_mut(&mut image, Rect::at(50, 40).of_size(80, 60), Luma([220]));

        let map = preprocessor.process_gray(image);
        assert_eq!(map.scale, 1.0);
        assert!(map.edges.get_pixel(50, 70)[0] > 0, "left border should be an edge");
        assert_eq!(map.edges.get_pixel(90, 70)[0], 0, "interior should stay empty");
        assert_eq!(map.edges.get_pixel(5, 5)[0], 0, "background should stay empty");
    }

    #[test]
    fn wide_frames_are_downscaled() {
        let preprocessor = EdgePreprocessor::new(&BoxVisionConfig::default().vision);
        let map = preprocessor.process_gray(GrayImage::from_pixel(2560, 100, Luma([0])));
        assert_eq!(map.edges.width(), 1280);
        assert_eq!(map.edges.height(), 50);
        assert!((map.scale - 0.5).abs() < 1e-12);
    }
}
