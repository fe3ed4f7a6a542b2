//! Stereo / monocular depth fusion.

use crate::{
    fit_inverse_depth, validate_depth, DepthError, DepthValidationParams, DisparityMap,
    InverseDepthMap, MonoCalibration, MonoFitParams,
};
use serde::{Deserialize, Serialize};
use stereoscope_core::DepthMap;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionMode {
    StereoOnly,
    MonoOnly,
    #[default]
    StereoPlusMono,
}

impl FusionMode {
    pub fn uses_mono(self) -> bool {
        !matches!(self, FusionMode::StereoOnly)
    }
}

/// Decides per pixel whether a stereo depth is trusted over mono.
pub trait DepthConfidence: Send + Sync {
    fn is_confident(&self, x: u32, y: u32, stereo_mm: f32, disparity: Option<f32>) -> bool;
}

/// Trusts stereo depth inside a fixed working range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepthRangeConfidence {
    pub min_mm: f32,
    pub max_mm: f32,
}

impl Default for DepthRangeConfidence {
    fn default() -> Self {
        Self {
            min_mm: 200.0,
            max_mm: 5_000.0,
        }
    }
}

impl DepthConfidence for DepthRangeConfidence {
    fn is_confident(&self, _x: u32, _y: u32, stereo_mm: f32, _disparity: Option<f32>) -> bool {
        stereo_mm.is_finite() && (self.min_mm..=self.max_mm).contains(&stereo_mm)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    pub mode: FusionMode,
    /// Run [`validate_depth`] on the stereo map first.
    pub validate_stereo: bool,
    pub validation: DepthValidationParams,
    pub fit: MonoFitParams,
    /// Refit the mono calibration on every frame; otherwise the last
    /// successful fit is reused once available.
    pub refit_each_frame: bool,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            mode: FusionMode::default(),
            validate_stereo: true,
            validation: DepthValidationParams::default(),
            fit: MonoFitParams::default(),
            refit_each_frame: true,
        }
    }
}

/// State of the monocular input for one frame.
#[derive(Clone, Copy, Debug)]
pub enum MonoInput<'a> {
    Available(&'a InverseDepthMap),
    /// The inference request did not answer in time.
    TimedOut,
    NotRequested,
}

/// Which input produced a fused pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthSource {
    #[default]
    None,
    Stereo,
    Mono,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionWarning {
    InferenceTimeout,
    CalibrationDegenerate { pairs: usize },
    MonoMissing,
}

impl std::fmt::Display for FusionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FusionWarning::InferenceTimeout => write!(f, "depth inference timed out, using stereo depth"),
            FusionWarning::CalibrationDegenerate { pairs } => {
                write!(f, "mono calibration degenerate ({pairs} pairs), using stereo depth")
            }
            FusionWarning::MonoMissing => write!(f, "no mono depth for this frame, using stereo depth"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FusionResult {
    pub depth: DepthMap,
    /// Per-pixel origin, row-major like `depth`.
    pub source: Vec<DepthSource>,
    /// Mono calibration used for this frame.
    pub calibration: Option<MonoCalibration>,
    pub warnings: Vec<FusionWarning>,
}

impl FusionResult {
    fn stereo(depth: DepthMap, warnings: Vec<FusionWarning>) -> Self {
        let source = depth
            .data()
            .iter()
            .map(|v| {
                if stereoscope_core::is_valid_depth(*v) {
                    DepthSource::Stereo
                } else {
                    DepthSource::None
                }
            })
            .collect();
        Self {
            depth,
            source,
            calibration: None,
            warnings,
        }
    }

    pub fn count(&self, source: DepthSource) -> usize {
        self.source.iter().filter(|s| **s == source).count()
    }
}

/// Combines stereo depth with calibrated monocular depth.
pub struct DepthFusion {
    params: FusionParams,
    confidence: Box<dyn DepthConfidence>,
    last_calibration: Option<MonoCalibration>,
}

impl std::fmt::Debug for DepthFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthFusion")
            .field("params", &self.params)
            .field("last_calibration", &self.last_calibration)
            .finish_non_exhaustive()
    }
}

impl Default for DepthFusion {
    fn default() -> Self {
        Self::new(FusionParams::default())
    }
}

impl DepthFusion {
    pub fn new(params: FusionParams) -> Self {
        Self::with_confidence(params, Box::new(DepthRangeConfidence::default()))
    }

    pub fn with_confidence(params: FusionParams, confidence: Box<dyn DepthConfidence>) -> Self {
        Self {
            params,
            confidence,
            last_calibration: None,
        }
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    pub fn mode(&self) -> FusionMode {
        self.params.mode
    }

    pub fn set_mode(&mut self, mode: FusionMode) {
        self.params.mode = mode;
    }

    /// Last successful mono calibration.
    pub fn last_calibration(&self) -> Option<&MonoCalibration> {
        self.last_calibration.as_ref()
    }

    /// Fuse one frame. The output always has the stereo map's size.
    ///
    /// Missing or unusable mono input degrades to stereo depth with a
    /// warning rather than an error.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, stereo, disparity, mono), fields(mode = ?self.params.mode))
    )]
    pub fn fuse(
        &mut self,
        stereo: &DepthMap,
        disparity: Option<&DisparityMap>,
        mono: MonoInput<'_>,
    ) -> Result<FusionResult, DepthError> {
        if let Some(d) = disparity {
            if d.size() != stereo.size() {
                return Err(DepthError::SizeMismatch {
                    expected: stereo.size(),
                    got: d.size(),
                });
            }
        }
        let stereo = if self.params.validate_stereo {
            validate_depth(stereo, &self.params.validation)
        } else {
            stereo.clone()
        };

        if !self.params.mode.uses_mono() {
            return Ok(FusionResult::stereo(stereo, Vec::new()));
        }

        let mono = match mono {
            MonoInput::Available(m) => m,
            MonoInput::TimedOut => {
                log::warn!("inference timed out, falling back to stereo depth");
                return Ok(FusionResult::stereo(
                    stereo,
                    vec![FusionWarning::InferenceTimeout],
                ));
            }
            MonoInput::NotRequested => {
                return Ok(FusionResult::stereo(stereo, vec![FusionWarning::MonoMissing]));
            }
        };
        let mono = mono.resize_bilinear(stereo.size());

        let reuse = (!self.params.refit_each_frame)
            .then_some(self.last_calibration)
            .flatten();
        let calibration = match reuse {
            Some(c) => c,
            None => {
                let confidence = &self.confidence;
                let fit = fit_inverse_depth(&stereo, &mono, &self.params.fit, |x, y, z| {
                    confidence.is_confident(x, y, z, disparity.and_then(|d| d.get(x, y)))
                });
                match fit {
                    Ok(c) => {
                        self.last_calibration = Some(c);
                        c
                    }
                    Err(DepthError::CalibrationDegenerate { pairs, .. }) => {
                        log::warn!("mono calibration degenerate with {pairs} pairs");
                        return Ok(FusionResult::stereo(
                            stereo,
                            vec![FusionWarning::CalibrationDegenerate { pairs }],
                        ));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let mono_mm = calibration.apply(&mono);
        let w = stereo.width() as usize;
        let mut depth = DepthMap::new(stereo.width(), stereo.height());
        let mut source = vec![DepthSource::None; stereo.size().area()];
        for (i, (out, src)) in depth.data_mut().iter_mut().zip(source.iter_mut()).enumerate() {
            let (x, y) = ((i % w) as u32, (i / w) as u32);
            let z_s = stereo.raw(x, y);
            let use_stereo = self.params.mode == FusionMode::StereoPlusMono
                && stereoscope_core::is_valid_depth(z_s)
                && self
                    .confidence
                    .is_confident(x, y, z_s, disparity.and_then(|d| d.get(x, y)));
            if use_stereo {
                *out = z_s;
                *src = DepthSource::Stereo;
            } else if let Some(z_m) = mono_mm.get(x as i64, y as i64) {
                *out = z_m;
                *src = DepthSource::Mono;
            }
        }

        let result = FusionResult {
            depth,
            source,
            calibration: Some(calibration),
            warnings: Vec::new(),
        };
        log::info!(
            "fused depth: {} stereo, {} mono, {} empty",
            result.count(DepthSource::Stereo),
            result.count(DepthSource::Mono),
            result.count(DepthSource::None)
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Stereo covers the left half of a tilted surface, mono the whole.
    fn inputs() -> (DepthMap, InverseDepthMap) {
        let truth = |x: u32, y: u32| 400.0 + x as f32 * 2.0 + y as f32;
        let stereo = DepthMap::from_fn(60, 40, |x, y| if x < 30 { truth(x, y) } else { f32::NAN });
        let mono = InverseDepthMap::from_fn(60, 40, |x, y| {
            ((1.0 / truth(x, y) as f64 - 2e-4) / 1e-3) as f32
        });
        (stereo, mono)
    }

    fn params(mode: FusionMode) -> FusionParams {
        FusionParams {
            mode,
            fit: MonoFitParams {
                min_pairs: 200,
                ..MonoFitParams::default()
            },
            ..FusionParams::default()
        }
    }

    #[test]
    fn stereo_plus_mono_fills_holes() {
        let (stereo, mono) = inputs();
        let mut fusion = DepthFusion::new(params(FusionMode::StereoPlusMono));
        let r = fusion.fuse(&stereo, None, MonoInput::Available(&mono)).unwrap();
        assert!(r.warnings.is_empty());
        assert_eq!(r.source[10], DepthSource::Stereo);
        assert_eq!(r.source[50], DepthSource::Mono);
        assert_relative_eq!(r.depth.raw(50, 10), 400.0 + 100.0 + 10.0, max_relative = 1e-3);
        assert!(fusion.last_calibration().is_some());
    }

    #[test]
    fn mono_only_uses_calibrated_mono_everywhere() {
        let (stereo, mono) = inputs();
        let mut fusion = DepthFusion::new(params(FusionMode::MonoOnly));
        let r = fusion.fuse(&stereo, None, MonoInput::Available(&mono)).unwrap();
        assert_eq!(r.count(DepthSource::Mono), 60 * 40);
        assert_relative_eq!(r.depth.raw(5, 5), 415.0, max_relative = 1e-3);
    }

    #[test]
    fn timeout_and_degenerate_fit_fall_back_to_stereo() {
        let (stereo, mono) = inputs();
        let mut fusion = DepthFusion::new(params(FusionMode::StereoPlusMono));
        let r = fusion.fuse(&stereo, None, MonoInput::TimedOut).unwrap();
        assert_eq!(r.warnings, vec![FusionWarning::InferenceTimeout]);
        assert_eq!(r.count(DepthSource::Mono), 0);

        let sparse = DepthMap::from_fn(60, 40, |x, y| if x + y == 0 { 500.0 } else { f32::NAN });
        let r = fusion.fuse(&sparse, None, MonoInput::Available(&mono)).unwrap();
        assert!(matches!(
            r.warnings[0],
            FusionWarning::CalibrationDegenerate { .. }
        ));
        assert_eq!(r.depth.valid_count(), sparse.valid_count());
    }

    #[test]
    fn stereo_only_ignores_mono() {
        let (stereo, mono) = inputs();
        let mut fusion = DepthFusion::new(params(FusionMode::StereoOnly));
        let r = fusion.fuse(&stereo, None, MonoInput::Available(&mono)).unwrap();
        assert_eq!(r.count(DepthSource::Mono), 0);
        assert!(r.calibration.is_none());
    }
}
