use crate::CoordinateFrame;
use nalgebra::{Matrix3, Matrix3x4, Point2, Point3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// Homogeneous weights below this magnitude are treated as points at infinity.
pub const PROJECTION_EPS: f64 = 1e-9;

/// Pinhole intrinsics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub const fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Read `fx, fy, cx, cy` from a 3x3 camera matrix.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)])
    }

    /// Read the intrinsic block of a rectified projection matrix.
    pub fn from_projection(p: &Matrix3x4<f64>) -> Self {
        Self::new(p[(0, 0)], p[(1, 1)], p[(0, 2)], p[(1, 2)])
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// `K [I | 0]`.
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        Matrix3x4::new(
            self.fx, 0.0, self.cx, 0.0, //
            0.0, self.fy, self.cy, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.fx.is_finite() && self.fy.is_finite() && self.cx.is_finite() && self.cy.is_finite()
    }

    /// Usable for back-projection: finite with non-zero focal lengths.
    pub fn is_usable(&self) -> bool {
        self.is_finite() && self.fx.abs() > PROJECTION_EPS && self.fy.abs() > PROJECTION_EPS
    }

    /// Express these intrinsics in `frame`, a sub-frame of the one they were
    /// calibrated in. Crops shift the principal point, rescaling divides
    /// focal lengths and principal point alike.
    pub fn in_frame(&self, frame: &CoordinateFrame) -> Self {
        let o = frame.origin_offset;
        let s = frame.scale;
        Self::new(
            self.fx / s.x,
            self.fy / s.y,
            (self.cx - o.x) / s.x,
            (self.cy - o.y) / s.y,
        )
    }

    /// Back-project `(u, v)` at depth `z` into the optical frame (x right, y down).
    #[inline]
    pub fn back_project(&self, u: f64, v: f64, z: f64) -> Point3<f64> {
        Point3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Pinhole projection of an optical-frame point.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        project_point(&self.projection_matrix(), p)
    }
}

/// Project a 3-D point with a 3x4 matrix; `None` when `|w|` is degenerate.
pub fn project_point(p: &Matrix3x4<f64>, x: &Point3<f64>) -> Option<Point2<f64>> {
    let h = p * Vector4::new(x.x, x.y, x.z, 1.0);
    let w = h[2];
    if !w.is_finite() || w.abs() < PROJECTION_EPS {
        return None;
    }
    Some(Point2::new(h[0] / w, h[1] / w))
}

/// Swap between the optical frame (y down) and the display frame (y up).
///
/// The transform is its own inverse.
#[inline]
pub fn flip_y(p: &Point3<f64>) -> Point3<f64> {
    Point3::new(p.x, -p.y, p.z)
}

/// `true` when every element of the vector is finite.
pub fn all_finite3(v: &Vector3<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageSize, PixelRect};
    use approx::assert_relative_eq;

    fn k() -> Intrinsics {
        Intrinsics::new(1000.0, 1000.0, 640.0, 360.0)
    }

    #[test]
    fn back_project_then_project_round_trips() {
        let k = k();
        for &(u, v, z) in &[(0.0, 0.0, 300.0), (500.0, 360.0, 500.0), (1279.0, 719.0, 1200.0)] {
            let p = k.back_project(u, v, z);
            let q = k.project(&p).unwrap();
            assert_relative_eq!(q.x, u, epsilon = 1e-9);
            assert_relative_eq!(q.y, v, epsilon = 1e-9);
        }
    }

    #[test]
    fn projection_behind_the_camera_plane_fails() {
        assert!(k().project(&Point3::new(1.0, 1.0, 0.0)).is_none());
    }

    #[test]
    fn crop_then_crop_equals_composed_offset() {
        let k = k();
        let roi = CoordinateFrame::crop(PixelRect::new(12, 7, 1200, 700));
        let crop = CoordinateFrame::crop(PixelRect::new(330, 0, 525, 700));

        let stepwise = k.in_frame(&roi).in_frame(&crop);
        let composed = k.in_frame(&roi.compose(&crop));
        assert_relative_eq!(stepwise.cx, composed.cx, epsilon = 1e-12);
        assert_relative_eq!(stepwise.cy, composed.cy, epsilon = 1e-12);
        assert_relative_eq!(composed.cx, 640.0 - 12.0 - 330.0);
        assert_relative_eq!(composed.cy, 360.0 - 7.0);
        assert_eq!(composed.fx, k.fx);
    }

    #[test]
    fn resize_scales_focal_and_principal_point() {
        let k = k();
        let half = CoordinateFrame::resize(ImageSize::new(1280, 720), ImageSize::new(640, 360));
        let k2 = k.in_frame(&half);
        assert_relative_eq!(k2.fx, 500.0);
        assert_relative_eq!(k2.cx, 320.0);
        assert_relative_eq!(k2.cy, 180.0);
    }
}
