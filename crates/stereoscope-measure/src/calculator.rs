//! Closed-form results for each measurement kind.

use crate::{Evaluation, MeasureError, MeasurementKind, ProfileResult};
use nalgebra::{Point3, Unit, Vector3};
use serde::{Deserialize, Serialize};
use stereoscope_core::{
    closest_points_between_lines, fan_area, plane_normal, polyline_length, project_onto_segment,
    signed_plane_distance, LineClosestPoints, GEOMETRY_EPS,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatorParams {
    /// Points deeper than this are flagged as abnormal.
    pub abnormal_depth_mm: f64,
    /// Largest closest-approach gap accepted between the two missing-area
    /// segments.
    pub max_line_gap_mm: f64,
}

impl Default for CalculatorParams {
    fn default() -> Self {
        Self {
            abnormal_depth_mm: 10_000.0,
            max_line_gap_mm: 10.0,
        }
    }
}

/// Distance from a probe to a segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointToLine {
    pub distance: f64,
    /// Closest point on the segment.
    pub foot: Point3<f64>,
    /// Perpendicular foot on the infinite line.
    pub line_foot: Point3<f64>,
    pub t: f64,
}

/// Distance from a probe to the plane through three points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaneDistance {
    /// Always non-negative.
    pub distance: f64,
    pub signed: f64,
    pub normal: Unit<Vector3<f64>>,
    /// Orthogonal projection of the probe onto the plane.
    pub foot: Point3<f64>,
}

pub fn length(a: &Point3<f64>, b: &Point3<f64>) -> f64 {
    (b - a).norm()
}

/// Distance from `probe` to segment `a..b`; past either end the distance is
/// to the nearer endpoint.
pub fn point_to_line(
    probe: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
) -> Result<PointToLine, MeasureError> {
    let proj = project_onto_segment(probe, a, b)
        .ok_or(MeasureError::DegenerateGeometry("line endpoints coincide"))?;
    Ok(PointToLine {
        distance: proj.distance,
        foot: proj.foot,
        line_foot: a + (b - a) * proj.t,
        t: proj.t,
    })
}

/// `|(p4 - p1) . n|` for the plane through `p1, p2, p3`.
pub fn point_to_plane(
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    p3: &Point3<f64>,
    probe: &Point3<f64>,
) -> Result<PlaneDistance, MeasureError> {
    let normal = plane_normal(p1, p2, p3)
        .ok_or(MeasureError::DegenerateGeometry("collinear plane points"))?;
    let signed = signed_plane_distance(probe, p1, &normal);
    Ok(PlaneDistance {
        distance: signed.abs(),
        signed,
        normal,
        foot: probe - normal.into_inner() * signed,
    })
}

/// Fan-triangulated area of a closed polygon.
pub fn polygon_area(points: &[Point3<f64>]) -> Result<f64, MeasureError> {
    if points.len() < 3 {
        return Err(MeasureError::DegenerateGeometry("polygon needs three vertices"));
    }
    Ok(fan_area(points))
}

/// Point minimising the summed squared distance to both lines.
pub fn segments_intersection(
    a1: &Point3<f64>,
    a2: &Point3<f64>,
    b1: &Point3<f64>,
    b2: &Point3<f64>,
) -> Result<LineClosestPoints, MeasureError> {
    if (a2 - a1).norm() < GEOMETRY_EPS || (b2 - b1).norm() < GEOMETRY_EPS {
        return Err(MeasureError::DegenerateGeometry("segment endpoints coincide"));
    }
    closest_points_between_lines(a1, a2, b1, b2)
        .ok_or(MeasureError::DegenerateGeometry("segments are parallel"))
}

pub fn format_length(mm: f64) -> String {
    format!("{mm:.2} mm")
}

pub fn format_depth(mm: f64) -> String {
    format!("Depth: {:.2} mm", mm.abs())
}

pub fn format_area(mm2: f64) -> String {
    format!("{mm2:.2} mm²")
}

pub fn format_profile(range_mm: f64, flat: bool) -> String {
    if flat {
        "surface flat".to_string()
    } else {
        format_length(range_mm)
    }
}

const ABNORMAL_SUFFIX: &str = " (abnormal)";

/// Results for completed pick lists.
#[derive(Clone, Debug, Default)]
pub struct MeasurementCalculator {
    params: CalculatorParams,
}

impl MeasurementCalculator {
    pub fn new(params: CalculatorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CalculatorParams {
        &self.params
    }

    fn is_abnormal(&self, points: &[Point3<f64>]) -> bool {
        points.iter().any(|p| p.z > self.params.abnormal_depth_mm)
    }

    fn check_count(
        kind: MeasurementKind,
        points: &[Point3<f64>],
        exact: bool,
    ) -> Result<(), MeasureError> {
        let expected = kind.min_picks();
        let ok = if exact {
            points.len() == expected
        } else {
            points.len() >= expected
        };
        if ok {
            Ok(())
        } else {
            Err(MeasureError::PointCount {
                kind,
                expected,
                got: points.len(),
            })
        }
    }

    /// Evaluate `points` for `kind`.
    ///
    /// `PointToLine` expects `[probe, line_a, line_b]`, `Depth` expects three
    /// plane points then the probe, `MissingArea` expects both segments, the
    /// intersection and at least two more vertices. `Profile` takes its value
    /// from `profile`.
    pub fn evaluate(
        &self,
        kind: MeasurementKind,
        points: &[Point3<f64>],
        profile: Option<&ProfileResult>,
    ) -> Result<Evaluation, MeasureError> {
        let (value, mut text) = match kind {
            MeasurementKind::Length => {
                Self::check_count(kind, points, true)?;
                let v = length(&points[0], &points[1]);
                (v, format_length(v))
            }
            MeasurementKind::PointToLine => {
                Self::check_count(kind, points, true)?;
                let v = point_to_line(&points[0], &points[1], &points[2])?.distance;
                (v, format_length(v))
            }
            MeasurementKind::Depth => {
                Self::check_count(kind, points, true)?;
                let v = point_to_plane(&points[0], &points[1], &points[2], &points[3])?.distance;
                (v, format_depth(v))
            }
            MeasurementKind::Area => {
                Self::check_count(kind, points, false)?;
                let v = polygon_area(points)?;
                (v, format_area(v))
            }
            MeasurementKind::Polyline => {
                Self::check_count(kind, points, false)?;
                let v = polyline_length(points);
                (v, format_length(v))
            }
            MeasurementKind::Profile => {
                Self::check_count(kind, points, true)?;
                let p = profile.ok_or(MeasureError::InsufficientSamples {
                    got: 0,
                    required: 2,
                })?;
                (p.range_mm, format_profile(p.range_mm, p.flat))
            }
            MeasurementKind::MissingArea => {
                Self::check_count(kind, points, false)?;
                let v = polygon_area(&points[4..])?;
                (v, format_area(v))
            }
        };

        let abnormal = self.is_abnormal(points);
        if abnormal {
            log::warn!("{kind} measurement has points beyond {} mm", self.params.abnormal_depth_mm);
            text.push_str(ABNORMAL_SUFFIX);
        }
        Ok(Evaluation {
            value,
            text,
            abnormal,
        })
    }
}
