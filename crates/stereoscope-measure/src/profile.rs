//! Surface profiles along a picked chord.
//!
//! Depth is read at evenly spaced pixels between the two clicks, every
//! sample is back-projected and compared against the straight 3-D chord
//! between the picked endpoints. The elevation sequence is then cleaned:
//!
//! 1. median/MAD outlier rejection, outliers re-interpolated from inliers;
//! 2. moving-average smoothing, reverting samples that moved unusually far.

use crate::{MeasureError, ProfileSample};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use stereoscope_core::{flip_y, DepthMap, Intrinsics, GEOMETRY_EPS};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileParams {
    /// Positions sampled along the chord, endpoints included.
    pub samples: usize,
    /// Nearest-valid search radius for samples that hit a hole.
    pub search_radius: u32,
    /// Outlier threshold in robust standard deviations.
    pub mad_k: f64,
    /// Scale turning a MAD into a standard deviation estimate.
    pub mad_scale: f64,
    /// Moving-average window, in samples.
    pub smooth_window: usize,
    /// Smoothed samples moving more than `mean + revert_sigma * stddev` of
    /// all moves are reverted.
    pub revert_sigma: f64,
    /// Ranges below this are reported as a flat surface.
    pub flat_threshold_mm: f64,
}

impl Default for ProfileParams {
    fn default() -> Self {
        Self {
            samples: 100,
            search_radius: 2,
            mad_k: 3.0,
            mad_scale: 1.4826,
            smooth_window: 5,
            revert_sigma: 3.0,
            flat_threshold_mm: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileResult {
    /// Back-projected samples, millimetres, Y-up.
    pub points_3d: Vec<Point3<f64>>,
    pub samples: Vec<ProfileSample>,
    /// `max - min` of the cleaned elevations.
    pub range_mm: f64,
    pub flat: bool,
}

/// Sample the profile between clicks `a_px` and `b_px` (depth-map pixels)
/// whose resolved points are `a` and `b`.
pub fn sample_profile(
    depth: &DepthMap,
    intrinsics: &Intrinsics,
    a_px: Point2<f64>,
    b_px: Point2<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    params: &ProfileParams,
) -> Result<ProfileResult, MeasureError> {
    let ab = b - a;
    let chord = ab.norm();
    if chord < GEOMETRY_EPS {
        return Err(MeasureError::DegenerateGeometry("profile endpoints coincide"));
    }

    let n = params.samples.max(2);
    let mut points_3d = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f64 / (n - 1) as f64;
        let px = a_px + (b_px - a_px) * t;
        let Some(hit) = depth.nearest_valid(
            px.x.round() as i64,
            px.y.round() as i64,
            params.search_radius,
        ) else {
            continue;
        };
        points_3d.push(flip_y(&intrinsics.back_project(
            hit.x as f64,
            hit.y as f64,
            hit.depth_mm as f64,
        )));
    }
    if points_3d.len() < 2 {
        return Err(MeasureError::InsufficientSamples {
            got: points_3d.len(),
            required: 2,
        });
    }

    let mut distances = Vec::with_capacity(points_3d.len());
    let mut elevations = Vec::with_capacity(points_3d.len());
    for p in &points_3d {
        let s = (p - a).dot(&ab) / (chord * chord);
        distances.push(s * chord);
        elevations.push(p.z - (a.z + s * ab.z));
    }
    clean_elevations(&mut elevations, params);

    let (lo, hi) = elevations
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &e| {
            (lo.min(e), hi.max(e))
        });
    let range_mm = hi - lo;
    let flat = range_mm < params.flat_threshold_mm;
    log::debug!(
        "profile: {} samples, range {:.3} mm{}",
        points_3d.len(),
        range_mm,
        if flat { " (flat)" } else { "" }
    );

    Ok(ProfileResult {
        points_3d,
        samples: distances
            .into_iter()
            .zip(elevations)
            .map(|(distance_mm, elevation_mm)| ProfileSample {
                distance_mm,
                elevation_mm,
            })
            .collect(),
        range_mm,
        flat,
    })
}

/// Outlier rejection followed by feature-preserving smoothing, in place.
pub fn clean_elevations(values: &mut [f64], params: &ProfileParams) {
    reject_outliers(values, params.mad_k, params.mad_scale);
    smooth_preserving(values, params.smooth_window, params.revert_sigma);
}

fn median(values: &[f64]) -> f64 {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let m = v.len() / 2;
    if v.len() % 2 == 0 {
        0.5 * (v[m - 1] + v[m])
    } else {
        v[m]
    }
}

fn reject_outliers(values: &mut [f64], k: f64, scale: f64) {
    if values.len() < 3 {
        return;
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&deviations);
    if mad <= 0.0 {
        return;
    }
    let limit = k * scale * mad;
    let inliers: Vec<usize> = (0..values.len())
        .filter(|&i| deviations[i] <= limit)
        .collect();
    if inliers.is_empty() || inliers.len() == values.len() {
        return;
    }
    log::debug!("profile: {} outliers", values.len() - inliers.len());

    let original = values.to_vec();
    for i in 0..values.len() {
        if deviations[i] <= limit {
            continue;
        }
        let next = inliers.partition_point(|&j| j < i);
        values[i] = match (next.checked_sub(1).map(|p| inliers[p]), inliers.get(next)) {
            (Some(l), Some(&r)) => {
                let t = (i - l) as f64 / (r - l) as f64;
                original[l] + t * (original[r] - original[l])
            }
            (Some(l), None) => original[l],
            (None, Some(&r)) => original[r],
            (None, None) => original[i],
        };
    }
}

fn smooth_preserving(values: &mut [f64], window: usize, sigma: f64) {
    let n = values.len();
    if window < 2 || n < window {
        return;
    }
    let half = window / 2;
    let smoothed: Vec<f64> = (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect();

    let diffs: Vec<f64> = smoothed
        .iter()
        .zip(values.iter())
        .map(|(s, v)| (s - v).abs())
        .collect();
    let mean = diffs.iter().sum::<f64>() / n as f64;
    let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n as f64;
    let limit = mean + sigma * var.sqrt();

    for i in 0..n {
        if diffs[i] <= limit {
            values[i] = smoothed[i];
        }
    }
}
