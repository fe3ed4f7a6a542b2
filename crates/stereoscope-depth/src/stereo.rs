//! Disparity to metric depth through the reprojection matrix.

use crate::{DisparityMap, StereoMatcher};
use crate::DepthError;
use image::{imageops, RgbImage};
use nalgebra::Matrix4;
use stereoscope_core::{DepthMap, ImageSize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Convert disparity to depth in millimetres using
/// `Z = Q[2,3] / (Q[3,2] * d + Q[3,3])`.
///
/// Non-positive disparities and non-positive depths become NaN.
pub fn disparity_to_depth(disparity: &DisparityMap, q: &Matrix4<f64>) -> DepthMap {
    let size = disparity.size();
    let (f, inv_b, offset) = (q[(2, 3)], q[(3, 2)], q[(3, 3)]);
    let data = disparity
        .data()
        .iter()
        .map(|&d| {
            if !d.is_finite() || d <= 0.0 {
                return f32::NAN;
            }
            let w = inv_b * d as f64 + offset;
            let z = f / w;
            if z.is_finite() && z > 0.0 {
                z as f32
            } else {
                f32::NAN
            }
        })
        .collect();
    DepthMap::from_vec(size.width, size.height, data)
        .unwrap_or_else(|_| DepthMap::new(size.width, size.height))
}

/// Disparity and depth of one rectified pair.
#[derive(Clone, Debug)]
pub struct StereoDepth {
    pub disparity: DisparityMap,
    pub depth: DepthMap,
}

/// Match a rectified colour pair and convert the result to depth.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(matcher, left, right, q))
)]
pub fn compute_stereo_depth<M: StereoMatcher + ?Sized>(
    matcher: &M,
    left: &RgbImage,
    right: &RgbImage,
    q: &Matrix4<f64>,
) -> Result<StereoDepth, DepthError> {
    if left.dimensions() != right.dimensions() {
        return Err(DepthError::SizeMismatch {
            expected: ImageSize::of(left),
            got: ImageSize::of(right),
        });
    }
    let disparity = matcher.compute(&imageops::grayscale(left), &imageops::grayscale(right))?;
    let depth = disparity_to_depth(&disparity, q);
    log::debug!(
        "stereo depth: {} of {} pixels valid",
        depth.valid_count(),
        depth.size().area()
    );
    Ok(StereoDepth { disparity, depth })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Q for f = 1000 px, baseline 4 mm, equal principal points.
    fn q() -> Matrix4<f64> {
        Matrix4::new(
            1.0, 0.0, 0.0, -640.0, //
            0.0, 1.0, 0.0, -360.0, //
            0.0, 0.0, 0.0, 1000.0, //
            0.0, 0.0, 0.25, 0.0,
        )
    }

    #[test]
    fn depth_is_focal_baseline_over_disparity() {
        let disp = DisparityMap::from_vec(3, 1, vec![8.0, 0.0, f32::NAN]).unwrap();
        let depth = disparity_to_depth(&disp, &q());
        assert_relative_eq!(depth.raw(0, 0), 500.0, epsilon = 1e-3);
        assert!(depth.get(1, 0).is_none());
        assert!(depth.get(2, 0).is_none());
    }

    #[test]
    fn size_mismatch_is_reported() {
        let m = crate::Matcher::default();
        let err = compute_stereo_depth(&m, &RgbImage::new(8, 8), &RgbImage::new(8, 9), &q())
            .unwrap_err();
        assert!(matches!(err, DepthError::SizeMismatch { .. }));
    }
}
