//! Bouguet stereo rectification with zero-disparity alignment.

use crate::{CameraCalibration, RectificationProducts, StereoCalibration};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Rotation3, Vector2, Vector3};
use stereoscope_core::{ImageSize, PixelRect, PROJECTION_EPS};

/// Border samples per side used to estimate the valid-pixel rectangles.
const ROI_GRID: usize = 9;

/// Compute `R1, R2, P1, P2, Q` and the valid ROIs for `size`.
///
/// Both cameras are rotated half-way towards each other, then jointly so
/// that the baseline lies on the x axis. The common focal length is the
/// smaller of the two `fy` (corrected for barrel distortion) and the
/// principal points are shared so that points at infinity have zero
/// disparity.
pub fn stereo_rectify(calib: &StereoCalibration, size: ImageSize) -> RectificationProducts {
    let om = Rotation3::from_matrix(&calib.rotation).scaled_axis();
    let r_half = Rotation3::new(om * -0.5).into_inner();
    let t = r_half * calib.translation;

    // Rotate the half-way translation onto +/- x.
    let c = t.x;
    let uu = Vector3::new(if c > 0.0 { 1.0 } else { -1.0 }, 0.0, 0.0);
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (c.abs() / t.norm()).clamp(-1.0, 1.0).acos() / nw;
    }
    let w_r = Rotation3::new(ww).into_inner();

    let r1 = w_r * r_half.transpose();
    let r2 = w_r * r_half;
    let t_rect = r2 * calib.translation;

    let nx = size.width as f64;
    let ny = size.height as f64;
    let fc = [&calib.left, &calib.right]
        .iter()
        .map(|cam| {
            let fy = cam.camera_matrix[(1, 1)];
            let k1 = cam.distortion.k1;
            if k1 != 0.0 {
                fy * (1.0 + k1 * (nx * nx + ny * ny) / (4.0 * fy * fy))
            } else {
                fy
            }
        })
        .fold(f64::INFINITY, f64::min);

    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(nx - 1.0, 0.0),
        Point2::new(0.0, ny - 1.0),
        Point2::new(nx - 1.0, ny - 1.0),
    ];
    let mut cc = Vector2::zeros();
    for (cam, r) in [(&calib.left, &r1), (&calib.right, &r2)] {
        let mut avg = Vector2::zeros();
        for p in &corners {
            let n = rectified_normalized(cam, r, *p);
            avg += n * fc;
        }
        avg /= corners.len() as f64;
        cc += Vector2::new((nx - 1.0) / 2.0, (ny - 1.0) / 2.0) - avg;
    }
    cc /= 2.0;

    let mut p1 = Matrix3x4::zeros();
    p1[(0, 0)] = fc;
    p1[(1, 1)] = fc;
    p1[(0, 2)] = cc.x;
    p1[(1, 2)] = cc.y;
    p1[(2, 2)] = 1.0;
    let mut p2 = p1;
    p2[(0, 3)] = t_rect.x * fc;

    let tx = t_rect.x;
    let mut q = Matrix4::identity();
    q[(0, 3)] = -cc.x;
    q[(1, 3)] = -cc.y;
    q[(2, 2)] = 0.0;
    q[(2, 3)] = fc;
    q[(3, 2)] = -1.0 / tx;
    q[(3, 3)] = 0.0;

    let roi1 = valid_roi(&calib.left, &r1, &p1, size);
    let roi2 = valid_roi(&calib.right, &r2, &p2, size);
    log::debug!(
        "rectified: f={fc:.2} c=({:.2}, {:.2}) Tx={tx:.3} roi1={roi1:?} roi2={roi2:?}",
        cc.x,
        cc.y
    );

    RectificationProducts {
        r1,
        r2,
        p1,
        p2,
        q,
        roi1,
        roi2,
    }
}

/// Undistort a raw pixel and rotate it into the rectified camera,
/// returning normalized coordinates.
fn rectified_normalized(cam: &CameraCalibration, r: &Matrix3<f64>, p: Point2<f64>) -> Vector2<f64> {
    let k = cam.intrinsics();
    let d = Vector2::new((p.x - k.cx) / k.fx, (p.y - k.cy) / k.fy);
    let n = cam.distortion.undistort(d);
    let v = r * Vector3::new(n.x, n.y, 1.0);
    if v.z.abs() < PROJECTION_EPS {
        return Vector2::new(n.x, n.y);
    }
    Vector2::new(v.x / v.z, v.y / v.z)
}

/// Largest axis-aligned rectangle inside the rectified image that only
/// contains pixels with a source in the raw image.
pub fn valid_roi(
    cam: &CameraCalibration,
    r: &Matrix3<f64>,
    p: &Matrix3x4<f64>,
    size: ImageSize,
) -> PixelRect {
    let nx = size.width as f64;
    let ny = size.height as f64;
    let (fx, fy, cx, cy) = (p[(0, 0)], p[(1, 1)], p[(0, 2)], p[(1, 2)]);

    let mut x0 = f64::NEG_INFINITY;
    let mut x1 = f64::INFINITY;
    let mut y0 = f64::NEG_INFINITY;
    let mut y1 = f64::INFINITY;
    let last = (ROI_GRID - 1) as f64;
    for j in 0..ROI_GRID {
        for i in 0..ROI_GRID {
            if i != 0 && j != 0 && i != ROI_GRID - 1 && j != ROI_GRID - 1 {
                continue;
            }
            let src = Point2::new(i as f64 * (nx - 1.0) / last, j as f64 * (ny - 1.0) / last);
            let n = rectified_normalized(cam, r, src);
            let u = fx * n.x + cx;
            let v = fy * n.y + cy;
            if i == 0 {
                x0 = x0.max(u);
            }
            if i == ROI_GRID - 1 {
                x1 = x1.min(u);
            }
            if j == 0 {
                y0 = y0.max(v);
            }
            if j == ROI_GRID - 1 {
                y1 = y1.min(v);
            }
        }
    }

    let left = x0.ceil().max(0.0);
    let top = y0.ceil().max(0.0);
    let right = x1.floor().min(nx);
    let bottom = y1.floor().min(ny);
    if !(left.is_finite() && top.is_finite() && right > left && bottom > top) {
        return PixelRect::new(0, 0, 0, 0);
    }
    PixelRect::new(
        left as i32,
        top as i32,
        (right - left) as u32,
        (bottom - top) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use stereoscope_core::{project_point, BrownConrady5};

    fn rig(rotation: Matrix3<f64>) -> StereoCalibration {
        let k = Matrix3::new(800.0, 0.0, 320.0, 0.0, 810.0, 240.0, 0.0, 0.0, 1.0);
        let cam = CameraCalibration::new(k, BrownConrady5::default());
        StereoCalibration {
            left: cam.clone(),
            right: cam,
            rotation,
            translation: Vector3::new(-5.0, 0.1, 0.05),
            image_size: ImageSize::new(640, 480),
            rectification: None,
        }
    }

    #[test]
    fn rectified_rows_align_for_a_rotated_rig() {
        let r = Rotation3::from_euler_angles(0.01, -0.02, 0.005).into_inner();
        let calib = rig(r);
        let rect = stereo_rectify(&calib, calib.image_size);

        // A world point in the left camera frame, seen by both cameras.
        let x_left = Vector3::new(12.0, -7.0, 150.0);
        let x_right = calib.rotation * x_left + calib.translation;

        let pl = project_point(&rect.p1, &(rect.r1 * x_left).into()).unwrap();

        let k2 = Matrix3x4::from_fn(|r, c| if c < 3 { rect.p2[(r, c)] } else { 0.0 });
        let pr = project_point(&k2, &(rect.r2 * x_right).into()).unwrap();
        assert_relative_eq!(pl.y, pr.y, epsilon = 1e-6);
        assert!(pl.x > pr.x, "positive disparity expected");
    }

    #[test]
    fn q_reprojects_disparity_to_depth() {
        let calib = rig(Matrix3::identity());
        let rect = stereo_rectify(&calib, calib.image_size);
        let f = rect.p1[(0, 0)];
        let b = calib.baseline();
        let z = 200.0;
        let d = f * b / z;
        let h = rect.q * nalgebra::Vector4::new(100.0, 100.0, d, 1.0);
        assert_relative_eq!(h[2] / h[3], z, max_relative = 1e-9);
        assert_relative_eq!(rect.focal_baseline(), f * b, max_relative = 1e-9);
    }

    #[test]
    fn roi_covers_the_image_without_distortion() {
        let calib = rig(Matrix3::identity());
        let rect = stereo_rectify(&calib, calib.image_size);
        assert!(!rect.roi1.is_empty());
        assert!(rect.roi1.fits(calib.image_size));
        assert!(rect.roi1.width > 500, "{:?}", rect.roi1);
    }
}
