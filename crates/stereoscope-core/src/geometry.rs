//! Closed-form 3-D geometry on measurement points.

use nalgebra::{Point2, Point3, Unit, Vector3};

/// Lengths below this are treated as zero.
pub const GEOMETRY_EPS: f64 = 1e-9;

/// `|d1 x d2|` threshold for unit direction vectors regarded as parallel.
pub const PARALLEL_EPS: f64 = 1e-6;

/// Projection of a point onto a segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentProjection {
    /// Unclamped line parameter, `0` at `a`, `1` at `b`.
    pub t: f64,
    /// Closest point on the segment.
    pub foot: Point3<f64>,
    pub distance: f64,
    /// `true` when the perpendicular foot fell outside the segment.
    pub clamped: bool,
}

/// Closest point of segment `a..b` to `p`; `None` when `a` and `b` coincide.
pub fn project_onto_segment(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
) -> Option<SegmentProjection> {
    let l = b - a;
    let ll = l.norm_squared();
    if ll.sqrt() < GEOMETRY_EPS {
        return None;
    }
    let v = p - a;
    let t = v.dot(&l) / ll;
    let (foot, clamped) = if t < 0.0 {
        (*a, true)
    } else if t > 1.0 {
        (*b, true)
    } else {
        (a + l * t, false)
    };
    Some(SegmentProjection {
        t,
        foot,
        distance: (p - foot).norm(),
        clamped,
    })
}

/// Unit normal of the plane through three points; `None` when collinear.
pub fn plane_normal(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Option<Unit<Vector3<f64>>> {
    let n = (b - a).cross(&(c - a));
    if n.norm() < GEOMETRY_EPS {
        return None;
    }
    Some(Unit::new_normalize(n))
}

/// Signed distance of `p` from the plane through `origin` with normal `n`.
#[inline]
pub fn signed_plane_distance(
    p: &Point3<f64>,
    origin: &Point3<f64>,
    n: &Unit<Vector3<f64>>,
) -> f64 {
    (p - origin).dot(n)
}

/// Orthogonal projection of `p` onto the plane.
pub fn project_onto_plane(
    p: &Point3<f64>,
    origin: &Point3<f64>,
    n: &Unit<Vector3<f64>>,
) -> Point3<f64> {
    p - n.into_inner() * signed_plane_distance(p, origin, n)
}

/// Area of a roughly planar polygon, triangulated as a fan from vertex 0.
pub fn fan_area(points: &[Point3<f64>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let p0 = points[0];
    points[1..]
        .windows(2)
        .map(|w| 0.5 * (w[0] - p0).cross(&(w[1] - p0)).norm())
        .sum()
}

/// Sum of consecutive segment lengths.
pub fn polyline_length(points: &[Point3<f64>]) -> f64 {
    points.windows(2).map(|w| (w[1] - w[0]).norm()).sum()
}

pub fn centroid(points: &[Point3<f64>]) -> Option<Point3<f64>> {
    if points.is_empty() {
        return None;
    }
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Some(Point3::from(sum / points.len() as f64))
}

/// Mutual closest points of two infinite 3-D lines.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineClosestPoints {
    pub on_first: Point3<f64>,
    pub on_second: Point3<f64>,
    /// Midpoint of the two closest points; minimises the summed squared
    /// distance to both lines.
    pub midpoint: Point3<f64>,
    /// Distance between the lines at their closest approach.
    pub gap: f64,
}

/// Closest approach of line `a1a2` and line `b1b2`.
///
/// Returns `None` for parallel or degenerate lines.
pub fn closest_points_between_lines(
    a1: &Point3<f64>,
    a2: &Point3<f64>,
    b1: &Point3<f64>,
    b2: &Point3<f64>,
) -> Option<LineClosestPoints> {
    let d1 = a2 - a1;
    let d2 = b2 - b1;
    let n1 = d1.norm();
    let n2 = d2.norm();
    if n1 < GEOMETRY_EPS || n2 < GEOMETRY_EPS {
        return None;
    }
    if (d1 / n1).cross(&(d2 / n2)).norm() < PARALLEL_EPS {
        return None;
    }

    // [d1.d1  -d1.d2] [s]   [ d1.r]
    // [d1.d2  -d2.d2] [t] = [ d2.r],  r = b1 - a1
    let r = b1 - a1;
    let a = d1.dot(&d1);
    let b = d1.dot(&d2);
    let c = d2.dot(&d2);
    let e = d1.dot(&r);
    let f = d2.dot(&r);
    let det = a * c - b * b;
    if det.abs() < GEOMETRY_EPS {
        return None;
    }
    let s = (e * c - b * f) / det;
    let t = (e * b - a * f) / det;

    let on_first = a1 + d1 * s;
    let on_second = b1 + d2 * t;
    Some(LineClosestPoints {
        on_first,
        on_second,
        midpoint: Point3::from((on_first.coords + on_second.coords) * 0.5),
        gap: (on_first - on_second).norm(),
    })
}

/// Intersection of the infinite 2-D lines through `a1a2` and `b1b2`.
pub fn line_intersection_2d(
    a1: &Point2<f64>,
    a2: &Point2<f64>,
    b1: &Point2<f64>,
    b2: &Point2<f64>,
) -> Option<Point2<f64>> {
    let d1 = a2 - a1;
    let d2 = b2 - b1;
    let denom = d1.x * d2.y - d1.y * d2.x;
    if denom.abs() < GEOMETRY_EPS * d1.norm().max(1.0) * d2.norm().max(1.0) {
        return None;
    }
    let r = b1 - a1;
    let s = (r.x * d2.y - r.y * d2.x) / denom;
    Some(a1 + d1 * s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn p(x: f64, y: f64, z: f64) -> Point3<f64> {
        Point3::new(x, y, z)
    }

    #[test]
    fn segment_projection_inside_and_past_the_end() {
        let a = p(0.0, 0.0, 500.0);
        let b = p(100.0, 0.0, 500.0);
        let inside = project_onto_segment(&p(50.0, 30.0, 500.0), &a, &b).unwrap();
        assert_relative_eq!(inside.distance, 30.0, epsilon = 1e-12);
        assert!(!inside.clamped);

        let past = project_onto_segment(&p(120.0, 0.0, 500.0), &a, &b).unwrap();
        assert_relative_eq!(past.distance, 20.0, epsilon = 1e-12);
        assert!(past.clamped);
        assert_eq!(past.foot, b);

        assert!(project_onto_segment(&a, &b, &b).is_none());
    }

    #[test]
    fn plane_distance_is_signed_and_normal_unit() {
        let n = plane_normal(&p(0.0, 0.0, 0.0), &p(1.0, 0.0, 0.0), &p(0.0, 1.0, 0.0)).unwrap();
        assert_relative_eq!(n.norm(), 1.0);
        let origin = p(0.0, 0.0, 0.0);
        assert_relative_eq!(signed_plane_distance(&p(3.0, 4.0, 5.0), &origin, &n), 5.0);
        let foot = project_onto_plane(&p(3.0, 4.0, -2.0), &origin, &n);
        assert_relative_eq!(foot.z, 0.0);
        assert!(plane_normal(&origin, &p(1.0, 1.0, 1.0), &p(2.0, 2.0, 2.0)).is_none());
    }

    #[test]
    fn fan_area_of_square_and_polyline_length() {
        let sq = [
            p(0.0, 0.0, 500.0),
            p(100.0, 0.0, 500.0),
            p(100.0, 100.0, 500.0),
            p(0.0, 100.0, 500.0),
        ];
        assert_relative_eq!(fan_area(&sq), 10_000.0, epsilon = 1e-9);
        assert_relative_eq!(polyline_length(&sq), 300.0, epsilon = 1e-9);
        assert_eq!(fan_area(&sq[..2]), 0.0);
        assert_relative_eq!(centroid(&sq).unwrap().x, 50.0);
    }

    #[test]
    fn skew_lines_meet_at_midpoint() {
        let c = closest_points_between_lines(
            &p(0.0, 0.0, 500.0),
            &p(100.0, 0.0, 500.0),
            &p(50.0, -50.0, 502.0),
            &p(50.0, 50.0, 502.0),
        )
        .unwrap();
        assert_relative_eq!(c.midpoint.x, 50.0, epsilon = 1e-9);
        assert_relative_eq!(c.midpoint.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(c.midpoint.z, 501.0, epsilon = 1e-9);
        assert_relative_eq!(c.gap, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn parallel_lines_have_no_closest_pair() {
        assert!(closest_points_between_lines(
            &p(0.0, 0.0, 0.0),
            &p(1.0, 0.0, 0.0),
            &p(0.0, 1.0, 0.0),
            &p(5.0, 1.0, 0.0),
        )
        .is_none());
    }

    #[test]
    fn two_d_lines_intersect_outside_the_segments() {
        let q = line_intersection_2d(
            &Point2::new(0.0, 0.0),
            &Point2::new(1.0, 0.0),
            &Point2::new(5.0, -1.0),
            &Point2::new(5.0, -2.0),
        )
        .unwrap();
        assert_relative_eq!(q.x, 5.0);
        assert_relative_eq!(q.y, 0.0);
        assert!(line_intersection_2d(
            &Point2::new(0.0, 0.0),
            &Point2::new(1.0, 1.0),
            &Point2::new(0.0, 1.0),
            &Point2::new(2.0, 3.0),
        )
        .is_none());
    }
}
