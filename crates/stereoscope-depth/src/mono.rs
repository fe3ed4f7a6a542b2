//! Monocular inverse depth and its metric calibration against stereo.

use crate::DepthError;
use serde::{Deserialize, Serialize};
use stereoscope_core::{is_valid_depth, DepthMap, ImageSize};

/// Relative inverse depth as returned by the inference service.
#[derive(Clone, Debug, PartialEq)]
pub struct InverseDepthMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl InverseDepthMap {
    pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Result<Self, DepthError> {
        let expected = ImageSize::new(width, height).area();
        if data.len() != expected {
            return Err(DepthError::InvalidParams(format!(
                "inverse depth buffer holds {} values, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(ImageSize::new(width, height).area());
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width as usize + x]
    }

    /// Bilinear resample to `size` with pixel-centre alignment.
    pub fn resize_bilinear(&self, size: ImageSize) -> InverseDepthMap {
        if size == self.size() {
            return self.clone();
        }
        if self.data.is_empty() {
            return InverseDepthMap::from_fn(size.width, size.height, |_, _| f32::NAN);
        }
        let sx = self.width as f32 / size.width.max(1) as f32;
        let sy = self.height as f32 / size.height.max(1) as f32;
        let max_x = self.width as usize - 1;
        let max_y = self.height as usize - 1;
        InverseDepthMap::from_fn(size.width, size.height, |x, y| {
            let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, max_x as f32);
            let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, max_y as f32);
            let x0 = fx.floor() as usize;
            let y0 = fy.floor() as usize;
            let x1 = (x0 + 1).min(max_x);
            let y1 = (y0 + 1).min(max_y);
            let (ax, ay) = (fx - x0 as f32, fy - y0 as f32);
            let top = self.at(x0, y0) * (1.0 - ax) + self.at(x1, y0) * ax;
            let bottom = self.at(x0, y1) * (1.0 - ax) + self.at(x1, y1) * ax;
            top * (1.0 - ay) + bottom * ay
        })
    }
}

/// Affine map from relative inverse depth `m` to metric inverse depth:
/// `1 / Z = scale * m + bias`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonoCalibration {
    pub scale: f64,
    pub bias: f64,
    /// Number of stereo/mono pairs the fit used.
    pub pairs: usize,
    /// RMS residual in inverse millimetres.
    pub rms: f64,
}

impl MonoCalibration {
    /// Metric depth for a relative inverse depth, when the model gives a
    /// positive inverse depth.
    #[inline]
    pub fn depth_mm(&self, inverse: f32) -> Option<f32> {
        if !inverse.is_finite() {
            return None;
        }
        let w = self.scale * inverse as f64 + self.bias;
        if w <= 0.0 || !w.is_finite() {
            return None;
        }
        let z = (1.0 / w) as f32;
        is_valid_depth(z).then_some(z)
    }

    /// Convert a whole inverse-depth map; pixels without a positive inverse
    /// depth become NaN.
    pub fn apply(&self, mono: &InverseDepthMap) -> DepthMap {
        let size = mono.size();
        DepthMap::from_fn(size.width, size.height, |x, y| {
            self.depth_mm(mono.at(x as usize, y as usize))
                .unwrap_or(f32::NAN)
        })
    }
}

/// Parameters of the mono-to-stereo least-squares fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonoFitParams {
    /// Lower percentile (0..100) of stereo depth kept for the fit.
    pub low_percentile: f64,
    /// Upper percentile (0..100) of stereo depth kept for the fit.
    pub high_percentile: f64,
    /// Fewer usable pairs than this makes the fit degenerate.
    pub min_pairs: usize,
}

impl Default for MonoFitParams {
    fn default() -> Self {
        Self {
            low_percentile: 0.5,
            high_percentile: 99.5,
            min_pairs: 500,
        }
    }
}

fn percentile(sorted: &[f32], pct: f64) -> f32 {
    let idx = ((pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx]
}

/// Fit `1 / Z_stereo = scale * m + bias` on pixels where `reliable(x, y, z)`
/// holds and both inputs are valid.
///
/// `mono` must already be resampled to the stereo map size.
pub fn fit_inverse_depth(
    stereo: &DepthMap,
    mono: &InverseDepthMap,
    params: &MonoFitParams,
    reliable: impl Fn(u32, u32, f32) -> bool,
) -> Result<MonoCalibration, DepthError> {
    if stereo.size() != mono.size() {
        return Err(DepthError::SizeMismatch {
            expected: stereo.size(),
            got: mono.size(),
        });
    }

    let mut pairs: Vec<(f32, f32)> = Vec::new();
    for y in 0..stereo.height() {
        for x in 0..stereo.width() {
            let z = stereo.raw(x, y);
            let m = mono.at(x as usize, y as usize);
            if is_valid_depth(z) && m.is_finite() && reliable(x, y, z) {
                pairs.push((z, m));
            }
        }
    }
    let degenerate = |n: usize| DepthError::CalibrationDegenerate {
        pairs: n,
        required: params.min_pairs,
    };
    if pairs.len() < params.min_pairs.max(2) {
        return Err(degenerate(pairs.len()));
    }

    let mut depths: Vec<f32> = pairs.iter().map(|p| p.0).collect();
    depths.sort_by(f32::total_cmp);
    let lo = percentile(&depths, params.low_percentile);
    let hi = percentile(&depths, params.high_percentile);
    pairs.retain(|(z, _)| *z >= lo && *z <= hi);
    if pairs.len() < params.min_pairs.max(2) {
        return Err(degenerate(pairs.len()));
    }

    let n = pairs.len() as f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
    for &(z, m) in &pairs {
        let (x, y) = (m as f64, 1.0 / z as f64);
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if denom.abs() <= 1e-12 * n * n {
        return Err(degenerate(pairs.len()));
    }
    let scale = (n * sxy - sx * sy) / denom;
    let bias = (sy - scale * sx) / n;
    if scale <= 0.0 || !scale.is_finite() || !bias.is_finite() {
        return Err(degenerate(pairs.len()));
    }
    let rms = (pairs
        .iter()
        .map(|&(z, m)| {
            let r = scale * m as f64 + bias - 1.0 / z as f64;
            r * r
        })
        .sum::<f64>()
        / n)
        .sqrt();

    log::debug!(
        "mono fit: scale={scale:.6e} bias={bias:.6e} pairs={} rms={rms:.3e}",
        pairs.len()
    );
    Ok(MonoCalibration {
        scale,
        bias,
        pairs: pairs.len(),
        rms,
    })
}
