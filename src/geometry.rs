//! Planar helpers shared by the detector, the calibration and the classifier.
//!
//! Corner quadruples are always in top-left, top-right, bottom-right,
//! bottom-left order once they leave [`order_points`].

use imageproc::geometry::convex_hull;
use imageproc::point::Point;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    fn sub(&self, other: &Point2) -> Point2 {
        Point2::new(self.x - other.x, self.y - other.y)
    }

    fn dot(&self, other: &Point2) -> f64 {
        self.x * other.x + self.y * other.y
    }

    fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Minimum-area enclosing rectangle of a point set.
#[derive(Debug, Clone, Copy)]
pub struct RotatedRect {
    /// Corners in hull traversal order, not yet ordered.
    pub corners: [Point2; 4],
    /// Orientation of the rectangle's first side, in degrees within (-90, 0].
    pub angle: f64,
}

/// Absolute polygon area (shoelace).
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice_area += f64::from(p.x) * f64::from(q.y) - f64::from(q.x) * f64::from(p.y);
    }
    twice_area.abs() / 2.0
}

/// Rotating-calipers search over the convex hull. Returns `None` when the
/// hull is degenerate (fewer than three distinct points).
pub fn min_area_rect(points: &[Point<i32>]) -> Option<RotatedRect> {
    let hull: Vec<Point2> = convex_hull(points)
        .into_iter()
        .map(|p| Point2::new(f64::from(p.x), f64::from(p.y)))
        .collect();
    if hull.len() < 3 {
        return None;
    }

    let mut best: Option<(f64, RotatedRect)> = None;
    for i in 0..hull.len() {
        let edge = hull[(i + 1) % hull.len()].sub(&hull[i]);
        let length = edge.norm();
        if length == 0.0 {
            continue;
        }
        let u = Point2::new(edge.x / length, edge.y / length);
        let v = Point2::new(-u.y, u.x);

        let (mut s_min, mut s_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut t_min, mut t_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for p in &hull {
            let s = p.dot(&u);
            let t = p.dot(&v);
            s_min = s_min.min(s);
            s_max = s_max.max(s);
            t_min = t_min.min(t);
            t_max = t_max.max(t);
        }

        let area = (s_max - s_min) * (t_max - t_min);
        if best.as_ref().map_or(true, |(best_area, _)| area < *best_area) {
            let corner = |s: f64, t: f64| Point2::new(u.x * s + v.x * t, u.y * s + v.y * t);
            let mut angle = u.y.atan2(u.x).to_degrees().rem_euclid(90.0);
            if angle > 0.0 {
                angle -= 90.0;
            }
            best = Some((
                area,
                RotatedRect {
                    corners: [
                        corner(s_min, t_min),
                        corner(s_max, t_min),
                        corner(s_max, t_max),
                        corner(s_min, t_max),
                    ],
                    angle,
                },
            ));
        }
    }

    best.filter(|(area, _)| *area > 0.0).map(|(_, rect)| rect)
}

/// Orders four corners as top-left, top-right, bottom-right, bottom-left.
///
/// The two leftmost points split into top-left/bottom-left by `y`; of the
/// two rightmost, the one farthest from top-left is bottom-right.
pub fn order_points(corners: [Point2; 4]) -> [Point2; 4] {
    let mut sorted = corners;
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));

    let (mut tl, mut bl) = (sorted[0], sorted[1]);
    if bl.y < tl.y {
        std::mem::swap(&mut tl, &mut bl);
    }

    let (mut tr, mut br) = (sorted[2], sorted[3]);
    if tl.distance(&tr) > tl.distance(&br) {
        std::mem::swap(&mut tr, &mut br);
    }

    [tl, tr, br, bl]
}

/// Folds a raw rectangle angle into [0, 90): angles below -45 are shifted
/// by +90, then the magnitude is taken.
pub fn normalize_angle(raw: f64) -> f64 {
    let folded = if raw < -45.0 { raw + 90.0 } else { raw };
    folded.abs()
}

/// Boundary-inclusive: a rectangle tilted exactly `max_deviation` from an
/// axis is accepted.
pub fn is_axis_aligned(angle: f64, max_deviation: f64) -> bool {
    angle.min(90.0 - angle) <= max_deviation
}

/// Interior angles at each corner, in degrees. `None` if any edge has zero length.
pub fn interior_angles(corners: &[Point2; 4]) -> Option<[f64; 4]> {
    let mut angles = [0.0; 4];
    for i in 0..4 {
        let here = corners[i];
        let prev = corners[(i + 3) % 4].sub(&here);
        let next = corners[(i + 1) % 4].sub(&here);

        let norm = prev.norm() * next.norm();
        if norm == 0.0 {
            return None;
        }
        let cos = (prev.dot(&next) / norm).clamp(-1.0, 1.0);
        angles[i] = cos.acos().to_degrees();
    }
    Some(angles)
}

/// 1.0 for a perfect rectangle, falling towards 0.0 as corners drift from 90 degrees.
pub fn rectangularity_score(angles: &[f64; 4]) -> f64 {
    let mean_deviation = angles.iter().map(|a| (a - 90.0).abs()).sum::<f64>() / 4.0;
    let folded = mean_deviation.min(180.0 - mean_deviation);
    (1.0 - folded / 90.0).clamp(0.0, 1.0)
}

/// Lengths of the top edge (tl→tr) and the right edge (tr→br).
pub fn edge_lengths(corners: &[Point2; 4]) -> (f64, f64) {
    (corners[0].distance(&corners[1]), corners[1].distance(&corners[2]))
}

pub fn centroid(corners: &[Point2; 4]) -> Point2 {
    let x = corners.iter().map(|p| p.x).sum::<f64>() / 4.0;
    let y = corners.iter().map(|p| p.y).sum::<f64>() / 4.0;
    Point2::new(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_points(x0: i32, y0: i32, x1: i32, y1: i32) -> Vec<Point<i32>> {
        let mut points = Vec::new();
        for x in x0..=x1 {
            points.push(Point::new(x, y0));
        }
        for y in y0 + 1..=y1 {
            points.push(Point::new(x1, y));
        }
        for x in (x0..x1).rev() {
            points.push(Point::new(x, y1));
        }
        for y in (y0 + 1..y1).rev() {
            points.push(Point::new(x0, y));
        }
        points
    }

    #[test]
    fn shoelace_area_of_square() {
        let square = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&square), 100.0);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }

    #[test]
    fn min_area_rect_of_axis_aligned_outline() {
        let rect = min_area_rect(&rect_points(10, 20, 50, 40)).expect("rectangle");
        let ordered = order_points(rect.corners);
        let (top, right) = edge_lengths(&ordered);

        assert!((top - 40.0).abs() < 1e-9);
        assert!((right - 20.0).abs() < 1e-9);
        assert!(normalize_angle(rect.angle) < 1e-9);
        assert!((ordered[0].x - 10.0).abs() < 1e-9 && (ordered[0].y - 20.0).abs() < 1e-9);
        assert!((ordered[2].x - 50.0).abs() < 1e-9 && (ordered[2].y - 40.0).abs() < 1e-9);
    }

    #[test]
    fn min_area_rect_rejects_collinear_points() {
        let line: Vec<Point<i32>> = (0..10).map(|x| Point::new(x, 3)).collect();
        assert!(min_area_rect(&line).is_none());
    }

    #[test]
    fn order_points_handles_shuffled_input() {
        let ordered = order_points([
            Point2::new(10.0, 10.0),
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 10.0),
            Point2::new(10.0, 0.0),
        ]);
        assert_eq!(
            ordered,
            [
                Point2::new(0.0, 0.0),
                Point2::new(10.0, 0.0),
                Point2::new(10.0, 10.0),
                Point2::new(0.0, 10.0),
            ]
        );
    }

    #[test]
    fn angle_normalization_folds_legacy_range() {
        assert_eq!(normalize_angle(-80.0), 10.0);
        assert_eq!(normalize_angle(-45.0), 45.0);
        assert_eq!(normalize_angle(-5.0), 5.0);
        assert_eq!(normalize_angle(0.0), 0.0);
        assert_eq!(normalize_angle(85.0), 85.0);
    }

    #[test]
    fn axis_alignment_is_boundary_inclusive() {
        for tenth in 0..900 {
            let angle = f64::from(tenth) / 10.0;
            let expected = angle.min(90.0 - angle) <= 10.0;
            assert_eq!(is_axis_aligned(angle, 10.0), expected, "angle {angle}");
        }
        assert!(is_axis_aligned(10.0, 10.0));
        assert!(is_axis_aligned(80.0, 10.0));
        assert!(!is_axis_aligned(10.5, 10.0));
        assert!(!is_axis_aligned(45.0, 10.0));
    }

    #[test]
    fn interior_angles_of_rectangle_are_right() {
        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(30.0, 0.0),
            Point2::new(30.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        let angles = interior_angles(&corners).expect("non-degenerate");
        for angle in angles {
            assert!((angle - 90.0).abs() < 1e-9);
        }
        assert!((rectangularity_score(&angles) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_length_edge_is_degenerate() {
        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 0.0),
            Point2::new(30.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        assert!(interior_angles(&corners).is_none());
    }

    #[test]
    fn skewed_quadrilateral_scores_lower() {
        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(30.0, 0.0),
            Point2::new(40.0, 10.0),
            Point2::new(10.0, 10.0),
        ];
        let angles = interior_angles(&corners).expect("non-degenerate");
        let score = rectangularity_score(&angles);
        assert!((score - 0.5).abs() < 1e-9, "score {score}");
    }

    #[test]
    fn edge_lengths_follow_corner_order() {
        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(140.0, 0.0),
            Point2::new(140.0, 142.0),
            Point2::new(0.0, 142.0),
        ];
        assert_eq!(edge_lengths(&corners), (140.0, 142.0));
        assert_eq!(centroid(&corners), Point2::new(70.0, 71.0));
    }
}
