use serde::Serialize;
use std::fmt;

use crate::calibration::CalibrationState;
use crate::config::ClassificationConfig;
use crate::detector::CandidateRectangle;
use crate::geometry::edge_lengths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BoxType {
    None,
    TenByTwenty,
    TwentyByTwenty,
    ThirtyByFifty,
    Unknown,
}

impl BoxType {
    pub fn label(&self) -> &'static str {
        match self {
            BoxType::None => "NONE",
            BoxType::TenByTwenty => "10x20",
            BoxType::TwentyByTwenty => "20x20",
            BoxType::ThirtyByFifty => "30x50",
            BoxType::Unknown => "UNKNOWN",
        }
    }

    /// Position in the catalog, which is also the tie-break order.
    pub fn catalog_index(&self) -> Option<usize> {
        CATALOG.iter().position(|entry| entry.box_type == *self)
    }
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub box_type: BoxType,
    pub width_cm: f64,
    pub height_cm: f64,
}

/// Known box sizes. Order matters: tolerance bands may overlap and the
/// first match wins.
pub const CATALOG: [CatalogEntry; 3] = [
    CatalogEntry {
        box_type: BoxType::TenByTwenty,
        width_cm: 10.0,
        height_cm: 20.0,
    },
    CatalogEntry {
        box_type: BoxType::TwentyByTwenty,
        width_cm: 20.0,
        height_cm: 20.0,
    },
    CatalogEntry {
        box_type: BoxType::ThirtyByFifty,
        width_cm: 30.0,
        height_cm: 50.0,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoxMeasurement {
    pub width_cm: f64,
    pub height_cm: f64,
    pub box_type: BoxType,
    pub valid: bool,
}

impl BoxMeasurement {
    fn rejected(width_cm: f64, height_cm: f64) -> Self {
        Self {
            width_cm,
            height_cm,
            box_type: BoxType::Unknown,
            valid: false,
        }
    }
}

pub struct BoxClassifier {
    tolerance_cm: f64,
}

impl BoxClassifier {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            tolerance_cm: config.tolerance_cm,
        }
    }

    /// Measures and classifies a non-reference rectangle. Uncalibrated state
    /// always yields an invalid `Unknown` measurement with zero dimensions.
    pub fn measure(&self, rect: &CandidateRectangle, calibration: &CalibrationState) -> BoxMeasurement {
        if !calibration.calibrated || calibration.pixels_per_cm <= 0.0 {
            return BoxMeasurement::rejected(0.0, 0.0);
        }

        let (a, b) = edge_lengths(&rect.corners);
        let width_cm = a.min(b) / calibration.pixels_per_cm;
        let height_cm = a.max(b) / calibration.pixels_per_cm;

        match self.classify(width_cm, height_cm) {
            Some(box_type) => BoxMeasurement {
                width_cm,
                height_cm,
                box_type,
                valid: true,
            },
            None => BoxMeasurement::rejected(width_cm, height_cm),
        }
    }

    /// First catalog entry matching in either orientation.
    pub fn classify(&self, width_cm: f64, height_cm: f64) -> Option<BoxType> {
        let within = |value: f64, reference: f64| (value - reference).abs() <= self.tolerance_cm;

        CATALOG
            .iter()
            .find(|entry| {
                let direct = within(width_cm, entry.width_cm) && within(height_cm, entry.height_cm);
                let swapped = within(width_cm, entry.height_cm) && within(height_cm, entry.width_cm);
                direct || swapped
            })
            .map(|entry| entry.box_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point2;

    fn classifier(tolerance_cm: f64) -> BoxClassifier {
        BoxClassifier::new(&ClassificationConfig { tolerance_cm })
    }

    fn rect(w: f64, h: f64) -> CandidateRectangle {
        CandidateRectangle {
            corners: [
                Point2::new(0.0, 0.0),
                Point2::new(w, 0.0),
                Point2::new(w, h),
                Point2::new(0.0, h),
            ],
            angle: 0.0,
            score: 1.0,
            area: w * h,
        }
    }

    fn calibrated(pixels_per_cm: f64) -> CalibrationState {
        CalibrationState {
            pixels_per_cm,
            calibrated: true,
            reference_size_cm: 2.0,
        }
    }

    #[test]
    fn classifies_near_ten_by_twenty() {
        assert_eq!(classifier(3.0).classify(10.5, 19.8), Some(BoxType::TenByTwenty));
    }

    #[test]
    fn classification_is_orientation_invariant() {
        let classifier = classifier(3.0);
        let samples = [(10.5, 19.8), (21.0, 18.5), (31.0, 48.0), (5.0, 5.0), (12.9, 22.9)];
        for (w, h) in samples {
            assert_eq!(classifier.classify(w, h), classifier.classify(h, w), "{w}x{h}");
        }
    }

    #[test]
    fn catalog_order_breaks_ties() {
        // 15x20 is 5 cm from both 10 and 20 on the short axis; with a wide band
        // both entries match and the first one wins.
        assert_eq!(classifier(5.0).classify(15.0, 20.0), Some(BoxType::TenByTwenty));
        assert_eq!(classifier(3.0).classify(15.0, 20.0), None);
    }

    #[test]
    fn tolerance_is_inclusive() {
        assert_eq!(classifier(3.0).classify(13.0, 23.0), Some(BoxType::TenByTwenty));
        assert_eq!(classifier(3.0).classify(13.01, 23.0), None);
    }

    #[test]
    fn measure_converts_and_canonicalizes() {
        let measurement = classifier(3.0).measure(&rect(840.0, 420.0), &calibrated(42.0));
        assert!(measurement.valid);
        assert_eq!(measurement.box_type, BoxType::TenByTwenty);
        assert!((measurement.width_cm - 10.0).abs() < 1e-9);
        assert!((measurement.height_cm - 20.0).abs() < 1e-9);
    }

    #[test]
    fn measure_rejects_unmatched_sizes() {
        let measurement = classifier(3.0).measure(&rect(420.0, 420.0), &calibrated(42.0));
        assert!(!measurement.valid);
        assert_eq!(measurement.box_type, BoxType::Unknown);
        assert!((measurement.width_cm - 10.0).abs() < 1e-9);
    }

    #[test]
    fn uncalibrated_measurement_is_unknown() {
        let state = CalibrationState {
            pixels_per_cm: 0.0,
            calibrated: false,
            reference_size_cm: 2.0,
        };
        let measurement = classifier(3.0).measure(&rect(840.0, 420.0), &state);
        assert_eq!(measurement.box_type, BoxType::Unknown);
        assert!(!measurement.valid);
    }

    #[test]
    fn catalog_indices_follow_declaration() {
        assert_eq!(BoxType::TenByTwenty.catalog_index(), Some(0));
        assert_eq!(BoxType::ThirtyByFifty.catalog_index(), Some(2));
        assert_eq!(BoxType::Unknown.catalog_index(), None);
    }
}
