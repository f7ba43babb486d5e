use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use serde::Serialize;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::geometry::{
    centroid, interior_angles, is_axis_aligned, min_area_rect, normalize_angle, order_points,
    polygon_area, rectangularity_score, Point2,
};

pub const MIN_ANGLE_TOLERANCE: f64 = 1.0;
pub const MAX_ANGLE_TOLERANCE: f64 = 45.0;

/// An accepted, axis-aligned rectangle from one frame.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRectangle {
    /// top-left, top-right, bottom-right, bottom-left
    pub corners: [Point2; 4],
    /// Rotation folded into [0, 90)
    pub angle: f64,
    pub score: f64,
    pub area: f64,
}

impl CandidateRectangle {
    pub fn center_x(&self) -> f64 {
        centroid(&self.corners).x
    }
}

/// Outcome of checking a single contour.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    TooSmall(f64),
    Degenerate,
    Tilted(f64),
    NotRectangular(f64),
}

pub struct AlignedRectangleDetector {
    min_contour_area: f64,
    max_angle_deviation: f64,
    min_rectangle_score: f64,
}

impl AlignedRectangleDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            min_contour_area: config.min_contour_area,
            max_angle_deviation: config.max_angle_deviation,
            min_rectangle_score: config.min_rectangle_score,
        }
    }

    pub fn max_angle_deviation(&self) -> f64 {
        self.max_angle_deviation
    }

    pub fn set_max_angle_deviation(&mut self, degrees: f64) -> f64 {
        self.max_angle_deviation = degrees.clamp(MIN_ANGLE_TOLERANCE, MAX_ANGLE_TOLERANCE);
        self.max_angle_deviation
    }

    pub fn widen_tolerance(&mut self) -> f64 {
        self.set_max_angle_deviation(self.max_angle_deviation + 1.0)
    }

    pub fn narrow_tolerance(&mut self) -> f64 {
        self.set_max_angle_deviation(self.max_angle_deviation - 1.0)
    }

    /// Finds aligned rectangles in a binary edge map, ordered left to right.
    pub fn detect(&self, edges: &GrayImage) -> Vec<CandidateRectangle> {
        let contours = find_contours::<i32>(edges);
        let mut accepted = Vec::new();
        let mut external = 0usize;

        for contour in contours
            .iter()
            .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
        {
            external += 1;
            let area = polygon_area(&contour.points);
            if area < self.min_contour_area {
                continue;
            }
            match self.check_contour(&contour.points, area) {
                Ok(rect) => accepted.push(rect),
                Err(reason) => debug!("Contour rejected: {:?}", reason),
            }
        }

        accepted.sort_by(|a, b| a.center_x().total_cmp(&b.center_x()));
        debug!(
            "{} external contours, {} aligned rectangles",
            external,
            accepted.len()
        );
        accepted
    }

    /// Checks one contour against the area, alignment and rectangularity gates.
    pub fn check_contour(
        &self,
        points: &[imageproc::point::Point<i32>],
        area: f64,
    ) -> Result<CandidateRectangle, Rejection> {
        if area < self.min_contour_area {
            return Err(Rejection::TooSmall(area));
        }

        let rect = min_area_rect(points).ok_or(Rejection::Degenerate)?;
        let angle = normalize_angle(rect.angle);
        if !is_axis_aligned(angle, self.max_angle_deviation) {
            return Err(Rejection::Tilted(angle));
        }

        let corners = order_points(rect.corners);
        let angles = interior_angles(&corners).ok_or(Rejection::Degenerate)?;
        let score = rectangularity_score(&angles);
        if score < self.min_rectangle_score {
            return Err(Rejection::NotRectangular(score));
        }

        Ok(CandidateRectangle {
            corners,
            angle,
            score,
            area,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoxVisionConfig;
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_polygon_mut};
    use imageproc::point::Point;
    use imageproc::rect::Rect;

    fn detector() -> AlignedRectangleDetector {
        AlignedRectangleDetector::new(&BoxVisionConfig::default().detection)
    }

    fn rotated_square(cx: f64, cy: f64, half: f64, degrees: f64) -> Vec<Point<i32>> {
        let theta = degrees.to_radians();
        [(-half, -half), (half, -half), (half, half), (-half, half)]
            .iter()
            .map(|(x, y)| {
                let rx = x * theta.cos() - y * theta.sin();
                let ry = x * theta.sin() + y * theta.cos();
                Point::new((cx + rx).round() as i32, (cy + ry).round() as i32)
            })
            .collect()
    }

    #[test]
    fn detects_rectangles_left_to_right() {
        let mut edges = GrayImage::new(400, 200);
        draw_filled_rect_mut(&mut edges, Rect::at(250, 40).of_size(100, 60), Luma([255]));
        draw_filled_rect_mut(&mut edges, Rect::at(20, 20).of_size(50, 50), Luma([255]));

        let rects = detector().detect(&edges);
        assert_eq!(rects.len(), 2);
        assert!(rects[0].center_x() < rects[1].center_x());
        assert!((rects[0].corners[0].x - 20.0).abs() < 1e-6);
        assert!(rects[1].score > 0.99);
    }

    #[test]
    fn drops_small_contours() {
        let mut edges = GrayImage::new(200, 200);
        draw_filled_rect_mut(&mut edges, Rect::at(10, 10).of_size(20, 20), Luma([255]));
        assert!(detector().detect(&edges).is_empty());
    }

    #[test]
    fn inner_holes_are_ignored() {
        let mut edges = GrayImage::new(300, 300);
        draw_filled_rect_mut(&mut edges, Rect::at(20, 20).of_size(200, 200), Luma([255]));
        draw_filled_rect_mut(&mut edges, Rect::at(30, 30).of_size(180, 180), Luma([0]));
        draw_filled_rect_mut(&mut edges, Rect::at(60, 60).of_size(80, 80), Luma([255]));

        let rects = detector().detect(&edges);
        assert_eq!(rects.len(), 1, "only the outermost border counts");
    }

    #[test]
    fn rejects_tilted_square() {
        let mut edges = GrayImage::new(300, 300);
        draw_polygon_mut(&mut edges, &rotated_square(150.0, 150.0, 60.0, 30.0), Luma([255]));
        assert!(detector().detect(&edges).is_empty());
    }

    #[test]
    fn accepts_slightly_tilted_square() {
        let mut edges = GrayImage::new(300, 300);
        draw_polygon_mut(&mut edges, &rotated_square(150.0, 150.0, 60.0, 5.0), Luma([255]));

        let rects = detector().detect(&edges);
        assert_eq!(rects.len(), 1);
        assert!(rects[0].angle.min(90.0 - rects[0].angle) <= 10.0);
    }

    #[test]
    fn runtime_tolerance_is_clamped() {
        let mut detector = detector();
        assert_eq!(detector.widen_tolerance(), 11.0);
        assert_eq!(detector.set_max_angle_deviation(80.0), MAX_ANGLE_TOLERANCE);
        assert_eq!(detector.set_max_angle_deviation(0.0), MIN_ANGLE_TOLERANCE);
        assert_eq!(detector.narrow_tolerance(), MIN_ANGLE_TOLERANCE);
    }

    #[test]
    fn rejection_reasons() {
        let detector = detector();
        let line: Vec<Point<i32>> = (0..50).map(|x| Point::new(x, 0)).collect();
        assert_eq!(detector.check_contour(&line, 5000.0).unwrap_err(), Rejection::Degenerate);
        assert!(matches!(
            detector.check_contour(&line, 10.0).unwrap_err(),
            Rejection::TooSmall(_)
        ));
    }
}
