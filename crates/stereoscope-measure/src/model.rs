//! Measurement objects.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementKind {
    Length,
    PointToLine,
    Depth,
    Area,
    Polyline,
    Profile,
    MissingArea,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 7] = [
        MeasurementKind::Length,
        MeasurementKind::PointToLine,
        MeasurementKind::Depth,
        MeasurementKind::Area,
        MeasurementKind::Polyline,
        MeasurementKind::Profile,
        MeasurementKind::MissingArea,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MeasurementKind::Length => "length",
            MeasurementKind::PointToLine => "point-to-line",
            MeasurementKind::Depth => "depth",
            MeasurementKind::Area => "area",
            MeasurementKind::Polyline => "polyline",
            MeasurementKind::Profile => "profile",
            MeasurementKind::MissingArea => "missing-area",
        }
    }

    /// Pick count that completes the measurement on its own.
    pub fn fixed_picks(self) -> Option<usize> {
        match self {
            MeasurementKind::Length | MeasurementKind::Profile => Some(2),
            MeasurementKind::PointToLine => Some(3),
            MeasurementKind::Depth => Some(4),
            MeasurementKind::Area | MeasurementKind::Polyline | MeasurementKind::MissingArea => None,
        }
    }

    /// Fewest picks a finished measurement may have.
    pub fn min_picks(self) -> usize {
        match self {
            MeasurementKind::Length | MeasurementKind::Profile | MeasurementKind::Polyline => 2,
            MeasurementKind::PointToLine | MeasurementKind::Area => 3,
            MeasurementKind::Depth => 4,
            // four segment ends, the intersection and two more vertices
            MeasurementKind::MissingArea => 7,
        }
    }

    /// Overlay colour, RGB.
    pub fn default_color(self) -> [u8; 3] {
        match self {
            MeasurementKind::Length | MeasurementKind::Depth => [0, 255, 0],
            MeasurementKind::PointToLine | MeasurementKind::MissingArea => [255, 255, 0],
            MeasurementKind::Area => [0, 0, 255],
            MeasurementKind::Polyline => [255, 165, 0],
            MeasurementKind::Profile => [255, 0, 255],
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Store-assigned identity of a measurement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeasurementId(pub u64);

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One point of a surface profile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSample {
    /// Position along the chord from the first endpoint.
    pub distance_mm: f64,
    /// Signed depth deviation from the chord.
    pub elevation_mm: f64,
}

/// Numeric result of a measurement with its display string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub value: f64,
    pub text: String,
    /// A point lies beyond the plausible depth range.
    pub abnormal: bool,
}

/// A completed measurement.
///
/// Points are millimetres in the Y-up camera frame. Click points are pixels
/// of the depth map the points were resolved against; for `MissingArea`
/// index 4 of both lists is the computed intersection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: MeasurementId,
    pub kind: MeasurementKind,
    pub points_mm: Vec<Point3<f64>>,
    pub click_points_px: Vec<Point2<f64>>,
    pub value: f64,
    pub result_text: String,
    #[serde(default)]
    pub abnormal: bool,
    pub color: [u8; 3],
    pub visible: bool,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub profile_3d_points: Vec<Point3<f64>>,
    #[serde(default)]
    pub profile_samples: Vec<ProfileSample>,
}

impl Measurement {
    pub fn new(
        kind: MeasurementKind,
        points_mm: Vec<Point3<f64>>,
        click_points_px: Vec<Point2<f64>>,
        evaluation: Evaluation,
    ) -> Self {
        Self {
            id: MeasurementId::default(),
            kind,
            points_mm,
            click_points_px,
            value: evaluation.value,
            result_text: evaluation.text,
            abnormal: evaluation.abnormal,
            color: kind.default_color(),
            visible: true,
            selected: false,
            profile_3d_points: Vec::new(),
            profile_samples: Vec::new(),
        }
    }

    /// Vertices of the measured polygon for area kinds, all points otherwise.
    pub fn polygon(&self) -> &[Point3<f64>] {
        match self.kind {
            MeasurementKind::MissingArea if self.points_mm.len() > 4 => &self.points_mm[4..],
            _ => &self.points_mm,
        }
    }

    /// Same kind and every point within `tolerance_mm`.
    pub fn matches(&self, other: &Measurement, tolerance_mm: f64) -> bool {
        self.kind == other.kind
            && self.points_mm.len() == other.points_mm.len()
            && self
                .points_mm
                .iter()
                .zip(&other.points_mm)
                .all(|(a, b)| (a - b).amax() <= tolerance_mm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(x: f64) -> Measurement {
        Measurement::new(
            MeasurementKind::Length,
            vec![Point3::new(0.0, 0.0, 500.0), Point3::new(x, 0.0, 500.0)],
            vec![Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)],
            Evaluation {
                value: x,
                text: format!("{x:.2} mm"),
                abnormal: false,
            },
        )
    }

    #[test]
    fn matching_uses_tolerance_and_kind() {
        assert!(m(100.0).matches(&m(100.0005), 0.001));
        assert!(!m(100.0).matches(&m(100.01), 0.001));
        let mut other = m(100.0);
        other.kind = MeasurementKind::Profile;
        assert!(!m(100.0).matches(&other, 0.001));
    }

    #[test]
    fn missing_area_polygon_starts_at_intersection() {
        let mut ma = m(1.0);
        ma.kind = MeasurementKind::MissingArea;
        ma.points_mm = (0..7).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        assert_eq!(ma.polygon().len(), 3);
        assert_eq!(ma.polygon()[0].x, 4.0);
    }

    #[test]
    fn serde_keeps_kind_names() {
        let json = serde_json::to_string(&MeasurementKind::PointToLine).unwrap();
        assert_eq!(json, "\"PointToLine\"");
        let back: Measurement = serde_json::from_str(&serde_json::to_string(&m(5.0)).unwrap()).unwrap();
        assert_eq!(back, m(5.0));
    }
}
